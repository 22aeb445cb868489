pub mod backoff;
pub mod cmd;
