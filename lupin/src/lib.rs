pub mod knn_memory;
pub mod svae;
pub mod svae_inference;
