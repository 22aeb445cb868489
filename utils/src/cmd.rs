use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command as TokioCommand;

#[derive(thiserror::Error, Debug)]
pub enum CmdError {
    #[error("Cmd error: {0}")]
    Generic(String),
    #[error("Subprocess {0} with arguments {1:?} failed with output: {2}")]
    Subprocess(String, Vec<String>, String),
    #[error("Subprocess {0} was killed after exceeding its {1:?} timeout")]
    Timeout(String, Duration),
    #[error("Command {0} with args {1:?} produced output that is not valid UTF8")]
    OutputParse(String, Vec<String>),
}

impl CmdError {
    pub fn subprocess_error(command: &std::process::Command, output: &std::process::Output) -> Self {
        let error_details = if output.stderr.is_empty() {
            String::from_utf8_lossy(&output.stdout).to_string()
        } else {
            String::from_utf8_lossy(&output.stderr).to_string()
        };

        Self::Subprocess(
            command.get_program().to_string_lossy().to_string(),
            command
                .get_args()
                .map(|arg| arg.to_string_lossy().to_string())
                .collect::<Vec<String>>(),
            error_details,
        )
    }

    pub fn output_parse_error(command: &std::process::Command) -> Self {
        Self::OutputParse(
            command.get_program().to_string_lossy().to_string(),
            command
                .get_args()
                .map(|arg| arg.to_string_lossy().to_string())
                .collect::<Vec<String>>(),
        )
    }

    /// Whether this failure is worth retrying. A killed-on-timeout process
    /// may succeed on a later attempt; a non-zero exit generally will not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_, _))
    }
}

pub type CmdResult<T> = std::result::Result<T, CmdError>;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Builder for a subprocess with a bounded timeout.
///
/// The child is spawned with `kill_on_drop`, so it is terminated on every
/// exit path: timeout, success, error, or the caller dropping the future.
#[derive(Debug)]
pub struct Cmd {
    command: TokioCommand,
    timeout: Duration,
    attempts: u32,
}

impl Cmd {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        let mut command = TokioCommand::new(program);
        command.kill_on_drop(true);
        command.stdin(Stdio::null());
        Self {
            command,
            timeout: DEFAULT_TIMEOUT,
            attempts: 1,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command.args(args);
        self
    }

    pub fn env<K, V>(mut self, key: K, value: V) -> Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.command.env(key, value);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub async fn output(mut self) -> CmdResult<String> {
        let mut last_error = None;
        for _attempt in 0..self.attempts.max(1) {
            let waited = tokio::time::timeout(self.timeout, self.command.output()).await;
            let output = match waited {
                Err(_) => {
                    // The timed-out output future has been dropped, which kills the child.
                    let program = self
                        .command
                        .as_std()
                        .get_program()
                        .to_string_lossy()
                        .to_string();
                    last_error = Some(CmdError::Timeout(program, self.timeout));
                    continue;
                }
                Ok(result) => result.map_err(|x| CmdError::Generic(x.to_string()))?,
            };

            if output.status.success() {
                return String::from_utf8(output.stdout)
                    .map_err(|_| CmdError::output_parse_error(self.command.as_std()));
            }
            last_error = Some(CmdError::subprocess_error(self.command.as_std(), &output));

            // Give some breathing time.
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(last_error.unwrap_or_else(|| CmdError::Generic("Invalid retry value".to_owned())))
    }
}
