mod claims;
mod jwt;

pub use claims::Claims;
pub use jwt::{bearer_token, JwtValidator};
