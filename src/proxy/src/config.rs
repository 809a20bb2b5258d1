//! Process configuration, read from the environment at startup. Mirrors
//! the `envconfig`-style `Specification` struct in
//! `examples/original_source/main.go`: every variable has a default and a
//! missing or unparsable value falls back to it rather than aborting
//! startup. `clap` is reserved for subcommand selection in the `cmd`
//! binary; this struct is populated purely from `std::env`.

use std::time::Duration;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_or_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_duration(raw: &str, default: Duration) -> Duration {
    let raw = raw.trim();
    let (num_part, unit) = raw
        .find(|c: char| !c.is_ascii_digit())
        .map(|i| raw.split_at(i))
        .unwrap_or((raw, "s"));
    let Ok(num) = num_part.parse::<u64>() else {
        return default;
    };
    match unit {
        "ms" => Duration::from_millis(num),
        "s" | "" => Duration::from_secs(num),
        "m" => Duration::from_secs(num * 60),
        "h" => Duration::from_secs(num * 3600),
        _ => default,
    }
}

fn env_duration(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .map(|raw| parse_duration(&raw, default))
        .unwrap_or(default)
}

/// Settings honored by the `proxy` subcommand, per spec §6's environment
/// variable table.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_address: String,
    pub con_timeout: Duration,
    pub log_file_name: String,
    pub rotate_time: Duration,
    pub admin_user: String,
    pub debug: bool,
    pub queue_capacity: usize,
}

impl ProxyConfig {
    pub fn from_env() -> Self {
        ProxyConfig {
            listen_address: env_or_string("LISTEN_ADDRESS", ":3306"),
            con_timeout: env_duration("CON_TIMEOUT", Duration::from_secs(300)),
            log_file_name: env_or_string("LOG_FILE_NAME", "mysql-audit.%Y%m%d%H.log.gz"),
            rotate_time: env_duration("ROTATE_TIME", Duration::from_secs(3600)),
            admin_user: env_or_string("ADMIN_USER", "admin"),
            debug: env_or("DEBUG", false),
            queue_capacity: 1000,
        }
    }

    /// Normalizes `LISTEN_ADDRESS`'s Go-style `:3306` shorthand (bind all
    /// interfaces) to something `TcpListener::bind` accepts directly.
    pub fn bind_address(&self) -> String {
        if let Some(port) = self.listen_address.strip_prefix(':') {
            format!("0.0.0.0:{port}")
        } else {
            self.listen_address.clone()
        }
    }
}

/// Settings honored by `gen-pem`, per spec §6/§12.
#[derive(Debug, Clone)]
pub struct PemConfig {
    pub host: String,
    pub valid_for_days: i64,
    pub rsa_bits: usize,
    pub ecdsa_curve: String,
    pub ed25519: bool,
}

impl PemConfig {
    pub fn from_env() -> Self {
        PemConfig {
            host: env_or_string("HOST", "localhost"),
            valid_for_days: env_or("TIME_DATE", 10_000),
            rsa_bits: env_or("RSA_BITS", 2048),
            ecdsa_curve: env_or_string("ECDSA_CURVE", ""),
            ed25519: env_or("ED25519", false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_suffixed_durations() {
        assert_eq!(parse_duration("300s", Duration::ZERO), Duration::from_secs(300));
        assert_eq!(parse_duration("1h", Duration::ZERO), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms", Duration::ZERO), Duration::from_millis(500));
        assert_eq!(parse_duration("42", Duration::ZERO), Duration::from_secs(42));
    }

    #[test]
    fn falls_back_on_garbage() {
        assert_eq!(
            parse_duration("garbage", Duration::from_secs(9)),
            Duration::from_secs(9)
        );
    }

    #[test]
    fn bind_address_expands_go_style_shorthand() {
        let mut cfg = ProxyConfig::from_env();
        cfg.listen_address = ":3306".to_string();
        assert_eq!(cfg.bind_address(), "0.0.0.0:3306");
        cfg.listen_address = "127.0.0.1:3307".to_string();
        assert_eq!(cfg.bind_address(), "127.0.0.1:3307");
    }
}
