pub mod checkpoint;
pub mod exact;
pub mod lines;
pub mod lsh;
pub mod minhash;
pub mod normalize;
pub mod select;
pub mod shingle;
pub mod union_find;

#[cfg(feature = "checkpoint")]
pub mod storage;
