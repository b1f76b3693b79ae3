//! Share-link parsing.
//!
//! Turns `vless://`, `vmess://` and `trojan://` links into a normalized
//! [`ServerDescriptor`]. Nothing here touches the network or the filesystem.

use std::collections::HashMap;
use std::fmt;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::{Host, Url};

use crate::error::ParseError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vless,
    Vmess,
    Trojan,
}

impl Protocol {
    const ALL: [Protocol; 3] = [Protocol::Vless, Protocol::Vmess, Protocol::Trojan];

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Vless => "vless",
            Protocol::Vmess => "vmess",
            Protocol::Trojan => "trojan",
        }
    }

    fn scheme_prefix(self) -> &'static str {
        match self {
            Protocol::Vless => "vless://",
            Protocol::Vmess => "vmess://",
            Protocol::Trojan => "trojan://",
        }
    }

    fn detect(link: &str) -> Option<Protocol> {
        Protocol::ALL.into_iter().find(|protocol| {
            let prefix = protocol.scheme_prefix();
            link.len() >= prefix.len()
                && link.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
        })
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Ws,
    Grpc,
}

impl Network {
    fn from_param(value: Option<&str>) -> Result<Self, ParseError> {
        let value = value.map(str::trim).unwrap_or("");
        match value.to_lowercase().as_str() {
            "" | "tcp" => Ok(Network::Tcp),
            "ws" => Ok(Network::Ws),
            "grpc" => Ok(Network::Grpc),
            _ => Err(ParseError::UnsupportedNetwork(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    #[default]
    None,
    Tls,
}

impl Security {
    fn from_param(value: &str) -> Result<Self, ParseError> {
        match value.trim().to_lowercase().as_str() {
            "" | "none" => Ok(Security::None),
            "tls" => Ok(Security::Tls),
            _ => Err(ParseError::UnsupportedSecurity(value.trim().to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum Credential {
    Vless {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        flow: Option<String>,
        encryption: String,
    },
    #[serde(rename_all = "camelCase")]
    Vmess {
        id: String,
        alter_id: u16,
        security: String,
    },
    Trojan {
        password: String,
    },
}

impl Credential {
    pub fn protocol(&self) -> Protocol {
        match self {
            Credential::Vless { .. } => Protocol::Vless,
            Credential::Vmess { .. } => Protocol::Vmess,
            Credential::Trojan { .. } => Protocol::Trojan,
        }
    }
}

/// Transport options. Which fields matter depends on `network` and `security`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transport {
    pub network: Network,
    pub security: Security,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_header: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
    /// Explicit tcp header type from the link (`headerType`/`header`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescriptor {
    tag: String,
    endpoint: Endpoint,
    credential: Credential,
    transport: Transport,
    fake_http_header: bool,
}

impl ServerDescriptor {
    fn new(
        tag: Option<String>,
        endpoint: Endpoint,
        credential: Credential,
        transport: Transport,
        fake_http_header: bool,
    ) -> Self {
        let tag = tag
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty())
            .unwrap_or_else(|| format!("{}-{}", credential.protocol(), endpoint.host));
        Self {
            tag,
            endpoint,
            credential,
            transport,
            fake_http_header,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.credential.protocol()
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Plain tcp without tls or an explicit header gets a synthesized
    /// HTTP request header in front of the stream.
    pub fn fake_http_header(&self) -> bool {
        self.fake_http_header
    }

    /// Host header the server expects, falling back to the endpoint host.
    pub fn effective_host_header(&self) -> &str {
        self.transport
            .host_header
            .as_deref()
            .unwrap_or(&self.endpoint.host)
    }

    pub fn effective_server_name(&self) -> &str {
        self.transport.sni.as_deref().unwrap_or(&self.endpoint.host)
    }
}

/// Result of parsing many links at once. Bad links are collected with their
/// input index instead of aborting the batch.
#[derive(Debug, Default)]
pub struct ParsedBatch {
    pub descriptors: Vec<ServerDescriptor>,
    pub failures: Vec<(usize, ParseError)>,
}

pub fn parse_links<S: AsRef<str>>(links: &[S]) -> ParsedBatch {
    let mut batch = ParsedBatch::default();
    for (index, link) in links.iter().enumerate() {
        let link = link.as_ref();
        if link.trim().is_empty() {
            continue;
        }
        match parse_share_link(link) {
            Ok(descriptor) => batch.descriptors.push(descriptor),
            Err(error) => {
                tracing::warn!(index, %error, "skipping share link");
                batch.failures.push((index, error));
            }
        }
    }
    batch
}

pub fn parse_share_link(link: &str) -> Result<ServerDescriptor, ParseError> {
    let trimmed = link.trim();
    match Protocol::detect(trimmed) {
        Some(Protocol::Vless) => parse_vless(trimmed),
        Some(Protocol::Vmess) => parse_vmess(trimmed),
        Some(Protocol::Trojan) => parse_trojan(trimmed),
        None => Err(ParseError::UnsupportedScheme(scheme_name(trimmed))),
    }
}

/// Extracts only host and port, for latency probing. Credentials and
/// transport options are not validated.
pub fn endpoint_of(link: &str) -> Result<Endpoint, ParseError> {
    let trimmed = link.trim();
    match Protocol::detect(trimmed) {
        Some(Protocol::Vless) | Some(Protocol::Trojan) => endpoint_from_url(&parse_url(trimmed)?),
        Some(Protocol::Vmess) => {
            let raw = decode_vmess_value(trimmed)?;
            let host = raw
                .get("add")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|host| !host.is_empty())
                .ok_or(ParseError::MissingField("host"))?;
            let port = port_from_value(raw.get("port"))?;
            Ok(Endpoint {
                host: host.to_string(),
                port,
            })
        }
        None => Err(ParseError::UnsupportedScheme(scheme_name(trimmed))),
    }
}

fn scheme_name(link: &str) -> String {
    link.split_once("://")
        .map(|(scheme, _)| scheme.to_string())
        .unwrap_or_else(|| link.chars().take(16).collect())
}

fn parse_vless(link: &str) -> Result<ServerDescriptor, ParseError> {
    let url = parse_url(link)?;
    let id = decode_component(url.username());
    if id.is_empty() {
        return Err(ParseError::MissingField("uuid"));
    }
    let endpoint = endpoint_from_url(&url)?;
    let params = query_map(&url);

    let network = Network::from_param(params.get("type").map(String::as_str))?;
    let security = match non_empty(&params, "security") {
        Some(value) => Security::from_param(value)?,
        // Links without an explicit security are assumed tls on 443.
        None if endpoint.port == 443 => Security::Tls,
        None => Security::None,
    };
    let fake_http_header = wants_fake_header(&params, network, security);
    let transport = transport_from_params(&params, network, security);

    let credential = Credential::Vless {
        id,
        flow: non_empty(&params, "flow").map(str::to_string),
        encryption: non_empty(&params, "encryption")
            .unwrap_or("none")
            .to_string(),
    };

    Ok(ServerDescriptor::new(
        fragment_tag(&url),
        endpoint,
        credential,
        transport,
        fake_http_header,
    ))
}

fn parse_trojan(link: &str) -> Result<ServerDescriptor, ParseError> {
    let url = parse_url(link)?;
    let mut password = decode_component(url.username());
    if password.is_empty() {
        if let Some(pass) = url.password() {
            password = decode_component(pass);
        }
    } else if let Some(pass) = url.password() {
        password = format!("{password}:{}", decode_component(pass));
    }
    if password.is_empty() {
        return Err(ParseError::MissingField("password"));
    }
    let endpoint = endpoint_from_url(&url)?;
    let params = query_map(&url);

    let network = Network::from_param(params.get("type").map(String::as_str))?;
    let security = match non_empty(&params, "security") {
        Some(value) => Security::from_param(value)?,
        None => Security::Tls,
    };
    let fake_http_header = wants_fake_header(&params, network, security);
    let transport = transport_from_params(&params, network, security);

    Ok(ServerDescriptor::new(
        fragment_tag(&url),
        endpoint,
        Credential::Trojan { password },
        transport,
        fake_http_header,
    ))
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct VmessPayload {
    ps: Option<String>,
    add: Option<String>,
    port: Option<Value>,
    id: Option<String>,
    aid: Option<Value>,
    scy: Option<String>,
    net: Option<String>,
    #[serde(rename = "type")]
    header_type: Option<String>,
    host: Option<String>,
    path: Option<String>,
    tls: Option<String>,
    sni: Option<String>,
    alpn: Option<String>,
}

fn parse_vmess(link: &str) -> Result<ServerDescriptor, ParseError> {
    let raw = decode_vmess_value(link)?;
    let port = port_from_value(raw.get("port"))?;
    let payload: VmessPayload =
        serde_json::from_value(raw).map_err(|e| ParseError::InvalidVmessJson(e.to_string()))?;

    let host = trimmed(payload.add).ok_or(ParseError::MissingField("host"))?;
    let id = trimmed(payload.id).ok_or(ParseError::MissingField("uuid"))?;
    let alter_id = match payload.aid {
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u16::try_from(v).ok()).unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse::<u16>().unwrap_or(0),
        _ => 0,
    };

    let network = Network::from_param(payload.net.as_deref())?;
    // Only an explicit "none" turns tls off; empty or absent still means tls.
    let security = match payload.tls.as_deref().map(str::trim) {
        Some(value) if value.eq_ignore_ascii_case("none") => Security::None,
        _ => Security::Tls,
    };

    let path = trimmed(payload.path);
    let transport = Transport {
        network,
        security,
        path: match network {
            Network::Ws => Some(path.clone().unwrap_or_else(|| "/".to_string())),
            _ => path.clone(),
        },
        host_header: trimmed(payload.host),
        service_name: match network {
            Network::Grpc => path,
            _ => None,
        },
        sni: trimmed(payload.sni),
        alpn: payload.alpn.as_deref().map(split_csv).unwrap_or_default(),
        header_type: trimmed(payload.header_type).filter(|kind| kind != "none"),
    };

    let credential = Credential::Vmess {
        id,
        alter_id,
        security: trimmed(payload.scy).unwrap_or_else(|| "auto".to_string()),
    };

    Ok(ServerDescriptor::new(
        payload.ps,
        Endpoint { host, port },
        credential,
        transport,
        false,
    ))
}

fn decode_vmess_value(link: &str) -> Result<Value, ParseError> {
    let encoded = &link[Protocol::Vmess.scheme_prefix().len()..];
    let encoded = encoded.split_once('#').map(|(head, _)| head).unwrap_or(encoded);
    let decoded = decode_base64_to_string(encoded)?;
    let value: Value = serde_json::from_str(decoded.trim())
        .map_err(|e| ParseError::InvalidVmessJson(e.to_string()))?;
    if !value.is_object() {
        return Err(ParseError::InvalidVmessJson("expected an object".to_string()));
    }
    Ok(value)
}

fn port_from_value(value: Option<&Value>) -> Result<u16, ParseError> {
    let port = match value {
        Some(Value::String(s)) => s
            .trim()
            .parse::<u16>()
            .map_err(|_| ParseError::InvalidPort(s.clone()))?,
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u16::try_from(v).ok())
            .ok_or_else(|| ParseError::InvalidPort(n.to_string()))?,
        Some(Value::Null) | None => return Err(ParseError::MissingField("port")),
        Some(other) => return Err(ParseError::InvalidPort(other.to_string())),
    };
    if port == 0 {
        return Err(ParseError::InvalidPort("0".to_string()));
    }
    Ok(port)
}

fn parse_url(link: &str) -> Result<Url, ParseError> {
    Url::parse(link).map_err(|e| match e {
        url::ParseError::InvalidPort => ParseError::InvalidPort(e.to_string()),
        _ => ParseError::MalformedUri(e.to_string()),
    })
}

fn endpoint_from_url(url: &Url) -> Result<Endpoint, ParseError> {
    let host = match url.host() {
        Some(Host::Ipv6(addr)) => addr.to_string(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Domain(domain)) => decode_component(domain),
        None => String::new(),
    };
    if host.is_empty() {
        return Err(ParseError::MissingField("host"));
    }
    let port = url.port().ok_or(ParseError::MissingField("port"))?;
    if port == 0 {
        return Err(ParseError::InvalidPort("0".to_string()));
    }
    Ok(Endpoint { host, port })
}

fn fragment_tag(url: &Url) -> Option<String> {
    url.fragment().map(decode_component)
}

fn wants_fake_header(params: &HashMap<String, String>, network: Network, security: Security) -> bool {
    network == Network::Tcp
        && security == Security::None
        && !params.contains_key("header")
        && !params.contains_key("headertype")
}

fn transport_from_params(
    params: &HashMap<String, String>,
    network: Network,
    security: Security,
) -> Transport {
    let path = non_empty(params, "path").map(str::to_string);
    Transport {
        network,
        security,
        path: match network {
            Network::Ws => Some(path.unwrap_or_else(|| "/".to_string())),
            _ => path,
        },
        host_header: non_empty(params, "host").map(str::to_string),
        service_name: match network {
            Network::Grpc => non_empty(params, "servicename")
                .or_else(|| non_empty(params, "service_name"))
                .map(str::to_string),
            _ => None,
        },
        sni: non_empty(params, "sni")
            .or_else(|| non_empty(params, "peer"))
            .map(str::to_string),
        alpn: params.get("alpn").map(|v| split_csv(v)).unwrap_or_default(),
        header_type: non_empty(params, "headertype")
            .or_else(|| non_empty(params, "header"))
            .filter(|kind| !kind.eq_ignore_ascii_case("none"))
            .map(str::to_string),
    }
}

fn non_empty<'a>(params: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn add_padding(value: &str) -> String {
    let remainder = value.len() % 4;
    if remainder == 0 {
        value.to_string()
    } else {
        format!("{value}{}", "=".repeat(4 - remainder))
    }
}

fn decode_base64_to_string(input: &str) -> Result<String, ParseError> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let candidates = [cleaned.clone(), cleaned.replace('-', "+").replace('_', "/")];
    for candidate in candidates {
        let padded = add_padding(&candidate);
        for engine in [URL_SAFE_NO_PAD, URL_SAFE, STANDARD_NO_PAD, STANDARD] {
            for attempt in [&candidate, &padded] {
                if let Ok(bytes) = engine.decode(attempt.as_bytes()) {
                    if let Ok(value) = String::from_utf8(bytes) {
                        return Ok(value);
                    }
                }
            }
        }
    }
    Err(ParseError::InvalidBase64)
}

fn query_map(url: &Url) -> HashMap<String, String> {
    url.query_pairs()
        .map(|(k, v)| (k.to_lowercase(), v.to_string()))
        .collect()
}

fn decode_component(value: &str) -> String {
    percent_decode_str(value)
        .decode_utf8_lossy()
        .trim()
        .to_string()
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}
