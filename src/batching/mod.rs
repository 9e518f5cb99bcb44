pub mod hybrid_batcher;
