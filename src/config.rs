use clap::Parser;

/// VBAN audio receiver: reconciles one or more redundant senders into a
/// single continuous PCM stream written to a named pipe, with a JSON
/// stats endpoint.
///
/// Log level defaults to info; set VERBOSE=1 for verbose or DEBUG=1 for
/// debug output on standard error.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Config {
    /// UDP port to listen on for VBAN packets
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// Output pipe path template; %f → format, %r → rate, %c → channels,
    /// %% → literal %
    pub pipe: String,

    /// Program to run when the first stream connects
    pub exec_on_connect: Option<String>,

    /// Program to run when the last stream disconnects
    pub exec_on_disconnect: Option<String>,

    /// TCP port for the JSON stats endpoint (defaults to the VBAN port)
    #[arg(long)]
    pub http_port: Option<u16>,
}

impl Config {
    pub fn resolved_http_port(&self) -> u16 {
        self.http_port.unwrap_or(self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_arguments() {
        let cfg = Config::parse_from([
            "vban-pipe-bridge",
            "6980",
            "/run/audio-%f.pipe",
            "/usr/local/bin/on-connect",
        ]);
        assert_eq!(cfg.port, 6980);
        assert_eq!(cfg.pipe, "/run/audio-%f.pipe");
        assert_eq!(cfg.exec_on_connect.as_deref(), Some("/usr/local/bin/on-connect"));
        assert!(cfg.exec_on_disconnect.is_none());
        assert_eq!(cfg.resolved_http_port(), 6980);
    }

    #[test]
    fn test_http_port_override() {
        let cfg = Config::parse_from([
            "vban-pipe-bridge",
            "6980",
            "pipe",
            "--http-port",
            "8080",
        ]);
        assert_eq!(cfg.resolved_http_port(), 8080);
    }

    #[test]
    fn test_port_zero_rejected() {
        assert!(Config::try_parse_from(["vban-pipe-bridge", "0", "pipe"]).is_err());
    }

    #[test]
    fn test_pipe_is_required() {
        assert!(Config::try_parse_from(["vban-pipe-bridge", "6980"]).is_err());
    }
}
