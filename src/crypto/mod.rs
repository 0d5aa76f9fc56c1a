/// Hashing and secret-handling primitives.
pub mod hash;
pub mod sensitive;
