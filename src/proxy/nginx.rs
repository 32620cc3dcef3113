//! nginx stream configuration

use std::fmt;

/// A single forwarding rule: listen port to target container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    pub listen_port: u16,
    /// Container network name of the target
    pub target_host: String,
    pub target_port: u16,
}

impl ProxyRoute {
    /// Forward `port` to the same port on `target_host`
    pub fn new(target_host: impl Into<String>, port: u16) -> Self {
        Self {
            listen_port: port,
            target_host: target_host.into(),
            target_port: port,
        }
    }

    /// Render the complete nginx.conf for this route
    pub fn render(&self) -> String {
        format!(
            "stream {{\n    server {{\n        listen {};\n        proxy_pass {}:{};\n    }}\n}}\nevents {{}}\n",
            self.listen_port, self.target_host, self.target_port
        )
    }

    /// Recover the route from a rendered config. Returns None for files
    /// that do not hold exactly one `listen` and one `proxy_pass`.
    pub fn parse(config: &str) -> Option<Self> {
        let mut listen = None;
        let mut pass = None;

        for statement in config.split(|c| c == ';' || c == '{' || c == '}') {
            let mut words = statement.split_whitespace();
            match (words.next(), words.next(), words.next()) {
                (Some("listen"), Some(port), None) => {
                    if listen.replace(port.parse::<u16>().ok()?).is_some() {
                        return None;
                    }
                }
                (Some("proxy_pass"), Some(target), None) => {
                    if pass.replace(target).is_some() {
                        return None;
                    }
                }
                _ => {}
            }
        }

        let (host, port) = pass?.rsplit_once(':')?;
        Some(Self {
            listen_port: listen?,
            target_host: host.to_string(),
            target_port: port.parse().ok()?,
        })
    }
}

impl fmt::Display for ProxyRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{} -> {}:{}", self.listen_port, self.target_host, self.target_port)
    }
}
