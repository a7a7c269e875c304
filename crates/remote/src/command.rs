//! Typed remote command builder.
//!
//! Commands are assembled from a program, arguments, and environment
//! assignments, then rendered with per-token shell quoting. Untrusted values
//! (hostnames, tokens, versions) only ever enter the command line through
//! quoted tokens, never through string interpolation.

/// Characters that never need quoting in a POSIX shell word.
fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '@' | '%' | '+' | '=' | ':' | ',' | '.' | '/' | '-')
}

/// Quote a single token for the remote shell.
///
/// Safe tokens pass through unchanged; anything else is wrapped in single
/// quotes with embedded quotes escaped as `'\''`.
#[must_use]
pub fn shell_quote(token: &str) -> String {
    if !token.is_empty() && token.chars().all(is_safe_char) {
        return token.to_string();
    }
    let mut quoted = String::with_capacity(token.len() + 2);
    quoted.push('\'');
    for c in token.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

/// One environment assignment carried by a command.
#[derive(Debug, Clone)]
struct EnvVar {
    key: String,
    value: String,
    /// Secret values are rendered normally but redacted in display output.
    secret: bool,
}

/// A parameterized command to run on a remote host.
#[derive(Debug, Clone)]
pub struct RemoteCommand {
    program: String,
    args: Vec<String>,
    env: Vec<EnvVar>,
    sudo: bool,
}

impl RemoteCommand {
    /// Create a command for the given program.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            sudo: false,
        }
    }

    /// Append a single argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append multiple arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment assignment.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push(EnvVar {
            key: key.into(),
            value: value.into(),
            secret: false,
        });
        self
    }

    /// Add an environment assignment whose value must not appear in logs.
    #[must_use]
    pub fn env_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push(EnvVar {
            key: key.into(),
            value: value.into(),
            secret: true,
        });
        self
    }

    /// Run the command through sudo.
    #[must_use]
    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    /// The program this command runs.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Render the full command line for the remote shell.
    #[must_use]
    pub fn render(&self) -> String {
        self.render_inner(false)
    }

    /// Render for log output, with secret values redacted.
    #[must_use]
    pub fn display(&self) -> String {
        self.render_inner(true)
    }

    fn render_inner(&self, redact: bool) -> String {
        let mut parts: Vec<String> = Vec::new();

        if self.sudo {
            parts.push("sudo".to_string());
            // sudo strips the caller environment, so assignments go through env(1)
            if !self.env.is_empty() {
                parts.push("env".to_string());
            }
        }

        for var in &self.env {
            let value = if redact && var.secret {
                "[redacted]".to_string()
            } else {
                shell_quote(&var.value)
            };
            parts.push(format!("{}={value}", var.key));
        }

        parts.push(shell_quote(&self.program));
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_tokens_pass_through() {
        let cmd = RemoteCommand::new("systemctl").args(["is-active", "k3s"]);
        assert_eq!(cmd.render(), "systemctl is-active k3s");
    }

    #[test]
    fn test_unsafe_tokens_are_quoted() {
        let cmd = RemoteCommand::new("echo").arg("hello world; rm -rf /");
        assert_eq!(cmd.render(), "echo 'hello world; rm -rf /'");
    }

    #[test]
    fn test_embedded_single_quote() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_empty_token_quoted() {
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_env_rendering() {
        let cmd = RemoteCommand::new("sh")
            .arg("/tmp/k3s-install.sh")
            .env("INSTALL_K3S_VERSION", "v1.30.2+k3s1");
        assert_eq!(
            cmd.render(),
            "INSTALL_K3S_VERSION='v1.30.2+k3s1' sh /tmp/k3s-install.sh"
        );
    }

    #[test]
    fn test_sudo_moves_env_through_env1() {
        let cmd = RemoteCommand::new("sh")
            .arg("/tmp/k3s-install.sh")
            .env("K3S_URL", "https://10.30.0.11:6443")
            .sudo();
        assert_eq!(
            cmd.render(),
            "sudo env K3S_URL='https://10.30.0.11:6443' sh /tmp/k3s-install.sh"
        );
    }

    #[test]
    fn test_secret_env_redacted_in_display_only() {
        let cmd = RemoteCommand::new("sh")
            .arg("install.sh")
            .env_secret("K3S_TOKEN", "K10abc::server:deadbeef");
        assert!(cmd.render().contains("deadbeef"));
        assert!(!cmd.display().contains("deadbeef"));
        assert!(cmd.display().contains("[redacted]"));
    }
}
