use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Transport protocol for a forwarded port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side of a port mapping. An empty address means "any" on the host
/// side and the guest's primary interface on the guest side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

/// A single host-to-guest port forward, written in YAML as a one-entry map:
///
/// ```yaml
/// ports:
///   - "tcp:127.0.0.1:2222": "10.0.0.2:22"
///   - 1234: 23
///   - 8080: 80
/// ```
///
/// The key accepts `proto:addr:port`, `addr:port`, or `port`; the value
/// accepts `addr:port` or `port`. The protocol defaults to tcp.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortRule {
    pub protocol: Protocol,
    pub host: Endpoint,
    pub guest: Endpoint,
}

impl fmt::Display for PortRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}-{}:{}",
            self.protocol, self.host.address, self.host.port, self.guest.address, self.guest.port
        )
    }
}

fn parse_port(s: &str) -> Result<u16, String> {
    s.parse::<u16>()
        .map_err(|_| format!("invalid port number: {s:?}"))
}

impl PortRule {
    /// Decode the map key: `proto:addr:port`, `addr:port`, or `port`.
    fn parse_host(key: &str) -> Result<(Protocol, Endpoint), String> {
        let toks: Vec<&str> = key.split(':').collect();
        match toks.as_slice() {
            [proto, addr, port] => {
                let protocol = match *proto {
                    "tcp" => Protocol::Tcp,
                    "udp" => Protocol::Udp,
                    other => {
                        return Err(format!(
                            "invalid port rule protocol {other:?}, must be 'tcp' or 'udp'"
                        ));
                    }
                };
                Ok((
                    protocol,
                    Endpoint {
                        address: (*addr).to_string(),
                        port: parse_port(port)?,
                    },
                ))
            }
            [addr, port] => Ok((
                Protocol::Tcp,
                Endpoint {
                    address: (*addr).to_string(),
                    port: parse_port(port)?,
                },
            )),
            [port] => Ok((
                Protocol::Tcp,
                Endpoint {
                    address: String::new(),
                    port: parse_port(port)?,
                },
            )),
            _ => Err(format!("invalid port rule key: {key:?}")),
        }
    }

    /// Decode the map value: `addr:port` or `port`.
    fn parse_guest(value: &str) -> Result<Endpoint, String> {
        let toks: Vec<&str> = value.split(':').collect();
        match toks.as_slice() {
            [addr, port] => Ok(Endpoint {
                address: (*addr).to_string(),
                port: parse_port(port)?,
            }),
            [port] => Ok(Endpoint {
                address: String::new(),
                port: parse_port(port)?,
            }),
            _ => Err(format!("invalid port rule value: {value:?}")),
        }
    }
}

/// Map keys and values may be strings or bare integers in YAML.
#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNum {
    Num(u64),
    Str(String),
}

impl StringOrNum {
    fn into_string(self) -> String {
        match self {
            Self::Num(n) => n.to_string(),
            Self::Str(s) => s,
        }
    }
}

impl<'de> Deserialize<'de> for PortRule {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RuleVisitor;

        impl<'de> Visitor<'de> for RuleVisitor {
            type Value = PortRule;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a single-entry map of host spec to guest spec")
            }

            fn visit_map<A>(self, mut map: A) -> Result<PortRule, A::Error>
            where
                A: MapAccess<'de>,
            {
                let Some((key, value)) = map.next_entry::<StringOrNum, StringOrNum>()? else {
                    return Err(de::Error::custom("port rule map is empty"));
                };
                if map.next_entry::<StringOrNum, StringOrNum>()?.is_some() {
                    return Err(de::Error::custom("port rule must be a single-entry map"));
                }
                let (protocol, host) =
                    PortRule::parse_host(&key.into_string()).map_err(de::Error::custom)?;
                let guest =
                    PortRule::parse_guest(&value.into_string()).map_err(de::Error::custom)?;
                Ok(PortRule {
                    protocol,
                    host,
                    guest,
                })
            }
        }

        deserializer.deserialize_map(RuleVisitor)
    }
}

impl Serialize for PortRule {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Always write the full three-part key so re-reading a persisted
        // definition yields the same rule regardless of the input form.
        let key = format!("{}:{}:{}", self.protocol, self.host.address, self.host.port);
        let value = if self.guest.address.is_empty() {
            self.guest.port.to_string()
        } else {
            format!("{}:{}", self.guest.address, self.guest.port)
        };
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&key, &value)?;
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(yaml: &str) -> PortRule {
        serde_yaml::from_str(yaml).expect("rule should parse")
    }

    #[test]
    fn full_form_decodes() {
        let r = rule(r#""tcp:127.0.0.1:2222": "10.0.0.2:22""#);
        assert_eq!(r.protocol, Protocol::Tcp);
        assert_eq!(r.host.address, "127.0.0.1");
        assert_eq!(r.host.port, 2222);
        assert_eq!(r.guest.address, "10.0.0.2");
        assert_eq!(r.guest.port, 22);
        assert_eq!(r.to_string(), "tcp:127.0.0.1:2222-10.0.0.2:22");
    }

    #[test]
    fn addr_port_form_defaults_to_tcp() {
        let r = rule(r#""localhost:8080": "80""#);
        assert_eq!(r.protocol, Protocol::Tcp);
        assert_eq!(r.host.address, "localhost");
        assert_eq!(r.host.port, 8080);
        assert_eq!(r.guest.address, "");
        assert_eq!(r.guest.port, 80);
    }

    #[test]
    fn bare_integer_form() {
        let r = rule("1234: 23");
        assert_eq!(r.protocol, Protocol::Tcp);
        assert_eq!(r.host.address, "");
        assert_eq!(r.host.port, 1234);
        assert_eq!(r.guest.port, 23);
        assert_eq!(r.to_string(), "tcp::1234-:23");
    }

    #[test]
    fn udp_is_accepted() {
        let r = rule(r#""udp:0.0.0.0:53": "53""#);
        assert_eq!(r.protocol, Protocol::Udp);
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let err = serde_yaml::from_str::<PortRule>(r#""sctp:0.0.0.0:53": "53""#)
            .expect_err("sctp should be rejected");
        assert!(err.to_string().contains("'tcp' or 'udp'"));
    }

    #[test]
    fn bad_port_is_rejected() {
        assert!(serde_yaml::from_str::<PortRule>(r#""tcp:host:notaport": "22""#).is_err());
        assert!(serde_yaml::from_str::<PortRule>(r#""99999": "22""#).is_err());
    }

    #[test]
    fn json_body_form_decodes() {
        let r: PortRule = serde_json::from_str(r#"{"tcp:127.0.0.1:2222": "10.0.0.2:22"}"#)
            .expect("json rule should parse");
        assert_eq!(r.to_string(), "tcp:127.0.0.1:2222-10.0.0.2:22");
    }

    #[test]
    fn round_trips_through_yaml() {
        let orig = rule(r#""8080": "172.16.0.9:80""#);
        let encoded = serde_yaml::to_string(&orig).expect("serialize");
        let back: PortRule = serde_yaml::from_str(&encoded).expect("reparse");
        assert_eq!(orig, back);
    }
}
