use candle_core::{DType, Result, Tensor, Var};
use candle_nn::{Optimizer, SGD};
use log::debug;
use serde::{Deserialize, Serialize};

/// Find `c` such that `f(c) ≈ target` by gradient descent on the
/// squared error `‖f(c) - target‖²`.
///
/// Stops as soon as the squared error falls below `tolerance` or after
/// `max_iter` steps, whichever comes first.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct InverseMapSolver {
    pub max_iter: usize,
    pub learning_rate: f64,
    pub tolerance: f64,
}

impl Default for InverseMapSolver {
    fn default() -> Self {
        Self {
            max_iter: 1000,
            learning_rate: 0.01,
            tolerance: 1e-3,
        }
    }
}

pub struct InverseMapOutput {
    /// detached solution, same shape as the initial point
    pub solution: Tensor,
    /// squared error at the returned solution
    pub residual: f64,
    pub iterations: usize,
    pub converged: bool,
}

impl InverseMapSolver {
    pub fn new(max_iter: usize, learning_rate: f64, tolerance: f64) -> Self {
        Self {
            max_iter,
            learning_rate,
            tolerance,
        }
    }

    /// * `f` - differentiable map
    /// * `init` - starting point
    /// * `target` - desired output of `f`
    pub fn solve<F>(&self, f: F, init: &Tensor, target: &Tensor) -> Result<InverseMapOutput>
    where
        F: Fn(&Tensor) -> Result<Tensor>,
    {
        let target = target.detach();
        let candidate = Var::from_tensor(&init.detach())?;
        let mut sgd = SGD::new(vec![candidate.clone()], self.learning_rate)?;

        let squared_error = |c: &Tensor| -> Result<Tensor> {
            f(c)?.broadcast_sub(&target)?.sqr()?.sum_all()
        };

        let mut iterations = 0;
        loop {
            let err = squared_error(candidate.as_tensor())?;
            let residual = err.to_dtype(DType::F64)?.to_scalar::<f64>()?;

            if residual < self.tolerance {
                return Ok(InverseMapOutput {
                    solution: candidate.as_tensor().detach(),
                    residual,
                    iterations,
                    converged: true,
                });
            }

            if iterations >= self.max_iter {
                debug!(
                    "inverse map stopped after {} steps with squared error {:.4e} (tolerance {:.1e})",
                    iterations, residual, self.tolerance
                );
                return Ok(InverseMapOutput {
                    solution: candidate.as_tensor().detach(),
                    residual,
                    iterations,
                    converged: false,
                });
            }

            sgd.backward_step(&err)?;
            iterations += 1;
        }
    }
}
