pub mod location;
pub mod stream;
