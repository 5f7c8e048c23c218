pub mod hint;
pub mod sync;
