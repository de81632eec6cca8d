use clap::Parser;

pub const DEFAULT_PORT: u16 = 1500;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TCP port to accept chat clients on. Use 0 for an ephemeral port.
    #[arg(default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_defaults_to_1500() {
        let cli = Cli::try_parse_from(["secure-chat-relay"]).expect("parse");
        assert_eq!(cli.port, DEFAULT_PORT);
    }

    #[test]
    fn explicit_port_is_used() {
        let cli = Cli::try_parse_from(["secure-chat-relay", "4000"]).expect("parse");
        assert_eq!(cli.port, 4000);
    }

    #[test]
    fn non_numeric_or_extra_arguments_are_usage_errors() {
        assert!(Cli::try_parse_from(["secure-chat-relay", "abc"]).is_err());
        assert!(Cli::try_parse_from(["secure-chat-relay", "70000"]).is_err());
        assert!(Cli::try_parse_from(["secure-chat-relay", "1500", "1501"]).is_err());
    }
}
