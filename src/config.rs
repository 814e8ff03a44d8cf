use std::path::PathBuf;
use std::time::Duration;

/// Serial byte format in the conventional three-character notation,
/// e.g. `8N1`, `8E1`, `8O2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialFormat {
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl SerialFormat {
    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        let chars: Vec<char> = s.trim().chars().collect();
        if chars.len() != 3 {
            return Err(format!("invalid serial format '{}' (expected e.g. 8E1)", s));
        }
        let data_bits = match chars[0] {
            '7' => 7,
            '8' => 8,
            c => return Err(format!("unsupported data bits '{}'", c)),
        };
        let parity = match chars[1].to_ascii_uppercase() {
            'N' => Parity::None,
            'E' => Parity::Even,
            'O' => Parity::Odd,
            c => return Err(format!("unsupported parity '{}'", c)),
        };
        let stop_bits = match chars[2] {
            '1' => 1,
            '2' => 2,
            c => return Err(format!("unsupported stop bits '{}'", c)),
        };
        Ok(SerialFormat {
            data_bits,
            parity,
            stop_bits,
        })
    }

    /// Bits on the wire per character: start bit + data + parity + stop.
    #[must_use]
    pub fn bits_per_char(&self) -> u32 {
        let parity_bit = if self.parity == Parity::None { 0 } else { 1 };
        1 + u32::from(self.data_bits) + parity_bit + u32::from(self.stop_bits)
    }

    /// Duration of one character at the given baud rate.
    #[must_use]
    pub fn char_time(&self, baud: u32) -> Duration {
        Duration::from_secs_f64(f64::from(self.bits_per_char()) / f64::from(baud))
    }
}

/// Parse a `host:port` bind spec. An empty host binds all interfaces.
pub fn parse_host_port(spec: &str) -> std::result::Result<(String, u16), String> {
    let Some((host, port_s)) = spec.rsplit_once(':') else {
        return Err(format!("invalid address '{}' (expected host:port)", spec));
    };
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    let port: u16 = port_s
        .parse()
        .map_err(|_| format!("invalid port in '{}'", spec))?;
    Ok((host.to_string(), port))
}

/// Settings for one serial leg of the broker.
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub device: String,
    pub baud: u32,
    pub format: SerialFormat,
}

/// Fully resolved broker configuration, built by `main` from the CLI.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub inverter: SerialSettings,
    /// `None` disables the Shine passthrough session.
    pub shine: Option<SerialSettings>,
    /// At least one bind is required.
    pub tcp_binds: Vec<(String, u16)>,
    pub sniff_bind: Option<(String, u16)>,
    pub min_period: Duration,
    pub read_timeout: Duration,
    /// `None` disables the JSON-lines file sink.
    pub log_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_formats() {
        let fmt = SerialFormat::parse("8E1").unwrap();
        assert_eq!(fmt.data_bits, 8);
        assert_eq!(fmt.parity, Parity::Even);
        assert_eq!(fmt.stop_bits, 1);
        assert_eq!(fmt.bits_per_char(), 11);

        let fmt = SerialFormat::parse("8n1").unwrap();
        assert_eq!(fmt.parity, Parity::None);
        assert_eq!(fmt.bits_per_char(), 10);
    }

    #[test]
    fn rejects_malformed_formats() {
        assert!(SerialFormat::parse("9E1").is_err());
        assert!(SerialFormat::parse("8X1").is_err());
        assert!(SerialFormat::parse("8E3").is_err());
        assert!(SerialFormat::parse("8E").is_err());
    }

    #[test]
    fn char_time_at_9600_8n1() {
        let fmt = SerialFormat::parse("8N1").unwrap();
        let t = fmt.char_time(9600);
        // 10 bits / 9600 baud ≈ 1.0417 ms
        assert!((t.as_secs_f64() - 0.0010417).abs() < 1e-6);
    }

    #[test]
    fn parses_host_port_specs() {
        assert_eq!(
            parse_host_port("0.0.0.0:5020").unwrap(),
            ("0.0.0.0".to_string(), 5020)
        );
        assert_eq!(
            parse_host_port(":5021").unwrap(),
            ("0.0.0.0".to_string(), 5021)
        );
        assert!(parse_host_port("5020").is_err());
        assert!(parse_host_port("host:notaport").is_err());
    }
}
