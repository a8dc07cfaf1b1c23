use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Streams swarm transfers while they download and browses the finished files.
///
/// Every option can also be set through the environment variable shown.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 3001)]
    pub port: u16,

    /// Address to bind to.
    #[arg(long, env = "BIND_ADDR", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind_addr: IpAddr,

    /// Directory holding one subdirectory per session.
    #[arg(long, env = "DOWNLOAD_DIR", default_value = "downloads")]
    pub download_dir: PathBuf,

    /// Login name accepted by `/api/login`. Login is disabled when unset.
    #[arg(long, env = "USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Tokens that are valid without logging in, comma separated.
    #[arg(long, env = "API_TOKENS", value_delimiter = ',', hide_env_values = true)]
    pub api_tokens: Vec<String>,

    /// Names hidden from the file listing, comma separated
    /// (`*suffix`, `.ext`, bare extension, or exact name).
    #[arg(long, env = "IGNORE_PATTERNS", value_delimiter = ',')]
    pub ignore_patterns: Vec<String>,

    /// Interval between progress pushes, in milliseconds.
    #[arg(long, env = "TICK_MS", default_value_t = 1000)]
    pub tick_ms: u64,

    /// Parallel range requests per web-seeded file.
    #[arg(long, env = "SEGMENTS", default_value_t = 4)]
    pub segments: usize,

    /// Attempts per segment before a transfer fails.
    #[arg(long, env = "RETRIES", default_value_t = 3)]
    pub retries: u32,

    /// Download rate limit in bytes per second, 0 for none.
    #[arg(long, env = "RATE_LIMIT", default_value_t = 0)]
    pub rate_limit: u64,

    /// Program used to render previews.
    #[arg(long, env = "FFMPEG", default_value = "ffmpeg")]
    pub ffmpeg: String,

    /// Offset of the frame grabbed for video previews.
    #[arg(long, env = "PREVIEW_SEEK", default_value = "00:00:30")]
    pub preview_seek: String,

    /// Width of generated previews in pixels.
    #[arg(long, env = "PREVIEW_WIDTH", default_value_t = 320)]
    pub preview_width: u32,
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_are_comma_separated() {
        let config = Config::try_parse_from([
            "swarmstream",
            "--port",
            "8080",
            "--api-tokens",
            "a,b",
            "--ignore-patterns",
            "*.part,nfo",
        ])
        .unwrap();
        assert_eq!(config.listen_addr().port(), 8080);
        assert_eq!(config.api_tokens, ["a", "b"]);
        assert_eq!(config.ignore_patterns, ["*.part", "nfo"]);
    }
}
