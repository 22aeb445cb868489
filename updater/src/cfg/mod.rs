mod command_line;
mod file;

pub use command_line::{Command, Options, Target, UpdateArgs};
pub use file::{parse_config, AnvilConfig, BackoffConfig, HttpConfig, SubprocessConfig};
