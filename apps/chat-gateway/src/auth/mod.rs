pub mod tokens;

pub use tokens::{JwtValidator, Rejected, TokenValidator};
