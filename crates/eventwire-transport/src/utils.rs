mod cancellation_token;
mod time_utils;

pub use cancellation_token::*;
pub use time_utils::*;
