pub mod candle_aux_layers;
pub mod candle_inverse_map;
pub mod candle_loss_functions;
pub mod candle_model_traits;
pub mod special_functions;
pub mod vmf_density;
pub mod vmf_sampler;

pub use candle_core;
pub use candle_nn;
