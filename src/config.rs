//! Xray configuration synthesis.
//!
//! The document is a typed tree whose serde field names are the engine's
//! JSON schema. It is built fresh for every connect attempt and written once
//! to a uniquely named file.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::BuildError;
use crate::link::{Credential, Network, Protocol, Security, ServerDescriptor};

pub const SOCKS_INBOUND_TAG: &str = "socks-in";
pub const DIRECT_TAG: &str = "direct";
pub const BLOCKED_TAG: &str = "blocked";

const FAKE_HEADER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    pub socks_host: String,
    pub socks_port: u16,
    pub allow_insecure: bool,
    /// Region code whose domains and IPs bypass the tunnel, e.g. `ir`.
    pub domestic_region: Option<String>,
    pub log_level: String,
    pub dns_servers: Vec<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            socks_host: crate::LOCAL_PROXY_HOST.to_string(),
            socks_port: crate::LOCAL_PROXY_PORT,
            allow_insecure: true,
            domestic_region: Some("ir".to_string()),
            log_level: "warning".to_string(),
            dns_servers: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfigDocument {
    pub log: Log,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub routing: Routing,
    pub dns: Dns,
}

impl ProxyConfigDocument {
    pub fn outbound(&self, tag: &str) -> Option<&Outbound> {
        self.outbounds.iter().find(|outbound| outbound.tag == tag)
    }

    /// Outbound tag of the last routing rule, where unmatched traffic goes.
    pub fn catch_all_tag(&self) -> Option<&str> {
        self.routing
            .rules
            .last()
            .map(|rule| rule.outbound_tag.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
    pub loglevel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    pub tag: String,
    pub port: u16,
    pub listen: String,
    pub protocol: String,
    pub sniffing: Sniffing,
    pub settings: SocksSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sniffing {
    pub enabled: bool,
    pub dest_override: Vec<String>,
    pub route_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocksSettings {
    pub auth: String,
    pub udp: bool,
    pub ip: String,
    pub allow_transparent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    pub tag: String,
    pub protocol: String,
    pub settings: OutboundSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mux: Option<Mux>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundSettings {
    Vnext { vnext: Vec<VnextServer> },
    Servers { servers: Vec<TrojanServer> },
    Empty {},
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VnextServer {
    pub address: String,
    pub port: u16,
    pub users: Vec<VnextUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VnextUser {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alter_id: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrojanServer {
    pub address: String,
    pub port: u16,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mux {
    pub enabled: bool,
    pub concurrency: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: Network,
    pub security: Security,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<WsSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc_settings: Option<GrpcSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_settings: Option<TcpSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    pub allow_insecure: bool,
    pub server_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpn: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsSettings {
    pub path: String,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcSettings {
    #[serde(default)]
    pub service_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpSettings {
    pub header: TcpHeader,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpHeader {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<HttpRequestHeader>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestHeader {
    pub version: String,
    pub method: String,
    pub path: Vec<String>,
    pub headers: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    pub domain_strategy: String,
    pub rules: Vec<RoutingRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    pub outbound_tag: String,
}

impl RoutingRule {
    fn field(outbound_tag: &str) -> Self {
        Self {
            kind: "field".to_string(),
            domain: None,
            ip: None,
            port: None,
            outbound_tag: outbound_tag.to_string(),
        }
    }

    fn domains(values: &[&str], outbound_tag: &str) -> Self {
        Self {
            domain: Some(values.iter().map(|v| v.to_string()).collect()),
            ..Self::field(outbound_tag)
        }
    }

    fn ips(values: &[&str], outbound_tag: &str) -> Self {
        Self {
            ip: Some(values.iter().map(|v| v.to_string()).collect()),
            ..Self::field(outbound_tag)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dns {
    pub servers: Vec<String>,
}

pub fn build(
    descriptors: &[ServerDescriptor],
    options: &BuildOptions,
) -> Result<ProxyConfigDocument, BuildError> {
    // The engine refuses duplicate tags, and the sinks' names are taken.
    let mut used: HashSet<String> = [DIRECT_TAG, BLOCKED_TAG]
        .into_iter()
        .map(str::to_string)
        .collect();
    let mut outbounds: Vec<Outbound> = descriptors
        .iter()
        .map(|descriptor| {
            let tag = unique_tag(descriptor.tag(), &mut used);
            server_outbound(descriptor, tag, options)
        })
        .collect();
    let primary_tag = outbounds
        .first()
        .map(|outbound| outbound.tag.clone())
        .ok_or(BuildError::EmptyInput)?;
    outbounds.push(Outbound {
        tag: DIRECT_TAG.to_string(),
        protocol: "freedom".to_string(),
        settings: OutboundSettings::Empty {},
        stream_settings: None,
        mux: None,
    });
    outbounds.push(Outbound {
        tag: BLOCKED_TAG.to_string(),
        protocol: "blackhole".to_string(),
        settings: OutboundSettings::Empty {},
        stream_settings: None,
        mux: None,
    });

    Ok(ProxyConfigDocument {
        log: Log {
            loglevel: options.log_level.clone(),
        },
        inbounds: vec![socks_inbound(options)],
        outbounds,
        routing: routing(&primary_tag, options.domestic_region.as_deref()),
        dns: Dns {
            servers: options.dns_servers.clone(),
        },
    })
}

fn socks_inbound(options: &BuildOptions) -> Inbound {
    Inbound {
        tag: SOCKS_INBOUND_TAG.to_string(),
        port: options.socks_port,
        listen: options.socks_host.clone(),
        protocol: "socks".to_string(),
        sniffing: Sniffing {
            enabled: true,
            dest_override: vec!["http".to_string(), "tls".to_string()],
            route_only: false,
        },
        settings: SocksSettings {
            auth: "noauth".to_string(),
            udp: true,
            ip: options.socks_host.clone(),
            allow_transparent: false,
        },
    }
}

fn routing(primary_tag: &str, domestic_region: Option<&str>) -> Routing {
    let mut rules = vec![
        RoutingRule::domains(&["geosite:category-ads"], BLOCKED_TAG),
        RoutingRule::domains(&["geosite:private"], DIRECT_TAG),
        RoutingRule::ips(&["geoip:private"], DIRECT_TAG),
    ];

    if let Some(region) = domestic_region.map(str::trim).filter(|r| !r.is_empty()) {
        let region = region.to_lowercase();
        let site = format!("geosite:category-{region}");
        let tld = format!("domain:{region}");
        let geoip = format!("geoip:{region}");
        rules.push(RoutingRule::domains(&[site.as_str(), tld.as_str()], DIRECT_TAG));
        rules.push(RoutingRule::ips(&[geoip.as_str()], DIRECT_TAG));
    }

    rules.push(RoutingRule {
        port: Some("0-65535".to_string()),
        ..RoutingRule::field(primary_tag)
    });

    Routing {
        domain_strategy: "IPIfNonMatch".to_string(),
        rules,
    }
}

fn unique_tag(base: &str, used: &mut HashSet<String>) -> String {
    let mut candidate = base.to_string();
    let mut index = 2;
    while used.contains(&candidate) {
        candidate = format!("{base}-{index}");
        index += 1;
    }
    used.insert(candidate.clone());
    candidate
}

fn server_outbound(descriptor: &ServerDescriptor, tag: String, options: &BuildOptions) -> Outbound {
    let endpoint = descriptor.endpoint();
    let settings = match descriptor.credential() {
        Credential::Vless {
            id,
            flow,
            encryption,
        } => OutboundSettings::Vnext {
            vnext: vec![VnextServer {
                address: endpoint.host.clone(),
                port: endpoint.port,
                users: vec![VnextUser {
                    id: id.clone(),
                    encryption: Some(encryption.clone()),
                    flow: flow.clone(),
                    alter_id: None,
                    security: None,
                }],
            }],
        },
        Credential::Vmess {
            id,
            alter_id,
            security,
        } => OutboundSettings::Vnext {
            vnext: vec![VnextServer {
                address: endpoint.host.clone(),
                port: endpoint.port,
                users: vec![VnextUser {
                    id: id.clone(),
                    encryption: None,
                    flow: None,
                    alter_id: Some(*alter_id),
                    security: Some(security.clone()),
                }],
            }],
        },
        Credential::Trojan { password } => OutboundSettings::Servers {
            servers: vec![TrojanServer {
                address: endpoint.host.clone(),
                port: endpoint.port,
                password: password.clone(),
            }],
        },
    };

    Outbound {
        tag,
        protocol: descriptor.protocol().as_str().to_string(),
        settings,
        stream_settings: Some(stream_settings(descriptor, options)),
        mux: Some(Mux {
            enabled: false,
            concurrency: -1,
        }),
    }
}

fn stream_settings(descriptor: &ServerDescriptor, options: &BuildOptions) -> StreamSettings {
    let transport = descriptor.transport();

    // Trojan outbounds always carry a tls block, even when security is none.
    let wants_tls =
        transport.security == Security::Tls || descriptor.protocol() == Protocol::Trojan;
    let tls_settings = wants_tls.then(|| TlsSettings {
        allow_insecure: options.allow_insecure,
        server_name: descriptor.effective_server_name().to_string(),
        alpn: (!transport.alpn.is_empty()).then(|| transport.alpn.clone()),
    });

    let ws_settings = (transport.network == Network::Ws).then(|| WsSettings {
        path: transport.path.clone().unwrap_or_else(|| "/".to_string()),
        headers: BTreeMap::from([(
            "Host".to_string(),
            descriptor.effective_host_header().to_string(),
        )]),
    });

    let grpc_settings = (transport.network == Network::Grpc).then(|| GrpcSettings {
        service_name: transport.service_name.clone().unwrap_or_default(),
    });

    let tcp_settings = if transport.network != Network::Tcp {
        None
    } else if descriptor.fake_http_header() {
        Some(fake_http_header(descriptor.effective_host_header()))
    } else {
        transport.header_type.as_ref().map(|kind| TcpSettings {
            header: TcpHeader {
                kind: kind.clone(),
                request: None,
            },
        })
    };

    StreamSettings {
        network: transport.network,
        security: transport.security,
        tls_settings,
        ws_settings,
        grpc_settings,
        tcp_settings,
    }
}

fn fake_http_header(host: &str) -> TcpSettings {
    let headers = BTreeMap::from([
        ("Host".to_string(), vec![host.to_string()]),
        (
            "User-Agent".to_string(),
            vec![FAKE_HEADER_USER_AGENT.to_string()],
        ),
        ("Accept".to_string(), vec!["*/*".to_string()]),
        (
            "Accept-Encoding".to_string(),
            vec!["gzip, deflate".to_string()],
        ),
        ("Connection".to_string(), vec!["keep-alive".to_string()]),
        ("Pragma".to_string(), vec!["no-cache".to_string()]),
    ]);
    TcpSettings {
        header: TcpHeader {
            kind: "http".to_string(),
            request: Some(HttpRequestHeader {
                version: "1.1".to_string(),
                method: "GET".to_string(),
                path: vec!["/".to_string()],
                headers,
            }),
        },
    }
}

/// Writes documents into a dedicated directory, one fresh file per call.
#[derive(Debug, Clone)]
pub struct ConfigWriter {
    dir: PathBuf,
}

impl ConfigWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, BuildError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| BuildError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write(&self, document: &ProxyConfigDocument) -> Result<PathBuf, BuildError> {
        let content = serde_json::to_string_pretty(document)?;
        let path = self.dir.join(format!("{}.json", uuid::Uuid::new_v4()));
        fs::write(&path, content).map_err(|source| BuildError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "wrote engine config");
        Ok(path)
    }
}

pub fn read_config(path: &Path) -> Result<ProxyConfigDocument, BuildError> {
    let raw = fs::read_to_string(path).map_err(|source| BuildError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::parse_share_link;

    const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    fn descriptor(link: &str) -> ServerDescriptor {
        parse_share_link(link).unwrap()
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(
            build(&[], &BuildOptions::default()),
            Err(BuildError::EmptyInput)
        ));
    }

    #[test]
    fn single_server_yields_three_outbounds() {
        let d = descriptor(&format!("vless://{UUID}@example.com:443#primary"));
        let doc = build(&[d], &BuildOptions::default()).unwrap();

        let tags: Vec<&str> = doc.outbounds.iter().map(|o| o.tag.as_str()).collect();
        assert_eq!(tags, vec!["primary", DIRECT_TAG, BLOCKED_TAG]);
        assert_eq!(doc.outbound(DIRECT_TAG).unwrap().protocol, "freedom");
        assert_eq!(doc.outbound(BLOCKED_TAG).unwrap().protocol, "blackhole");
        assert_eq!(doc.catch_all_tag(), Some("primary"));
        assert_eq!(doc.routing.rules.last().unwrap().port.as_deref(), Some("0-65535"));
    }

    #[test]
    fn first_descriptor_wins_catch_all() {
        let first = descriptor(&format!("vless://{UUID}@a.example.com:443#first"));
        let second = descriptor("trojan://pw@b.example.com:443#second");
        let input = vec![first, second];
        for _ in 0..3 {
            let doc = build(&input, &BuildOptions::default()).unwrap();
            assert_eq!(doc.catch_all_tag(), Some("first"));
            assert_eq!(doc.outbounds.len(), 4);
        }
    }

    #[test]
    fn repeated_tags_get_suffixes() {
        let a = descriptor("trojan://pw@same.example.com:443");
        let b = descriptor("trojan://other@same.example.com:443");
        let doc = build(&[a, b], &BuildOptions::default()).unwrap();
        let tags: Vec<&str> = doc.outbounds.iter().map(|o| o.tag.as_str()).collect();
        assert_eq!(
            tags,
            vec![
                "trojan-same.example.com",
                "trojan-same.example.com-2",
                DIRECT_TAG,
                BLOCKED_TAG
            ]
        );
        assert_eq!(doc.catch_all_tag(), Some("trojan-same.example.com"));
    }

    #[test]
    fn server_named_like_a_sink_is_renamed() {
        let d = descriptor("trojan://pw@h.example.com:443#direct");
        let doc = build(&[d], &BuildOptions::default()).unwrap();
        let tags: Vec<&str> = doc.outbounds.iter().map(|o| o.tag.as_str()).collect();
        assert_eq!(tags, vec!["direct-2", DIRECT_TAG, BLOCKED_TAG]);
        assert_eq!(doc.catch_all_tag(), Some("direct-2"));
        assert_eq!(doc.outbound("direct-2").unwrap().protocol, "trojan");
        assert_eq!(doc.outbound(DIRECT_TAG).unwrap().protocol, "freedom");

        let d = descriptor("trojan://pw@h.example.com:443#blocked");
        let doc = build(&[d], &BuildOptions::default()).unwrap();
        assert_eq!(doc.catch_all_tag(), Some("blocked-2"));
    }

    #[test]
    fn rules_follow_fixed_precedence() {
        let d = descriptor(&format!("vless://{UUID}@example.com:443#p"));
        let doc = build(&[d.clone()], &BuildOptions::default()).unwrap();
        let targets: Vec<&str> = doc
            .routing
            .rules
            .iter()
            .map(|r| r.outbound_tag.as_str())
            .collect();
        assert_eq!(targets, vec![BLOCKED_TAG, DIRECT_TAG, DIRECT_TAG, DIRECT_TAG, DIRECT_TAG, "p"]);
        assert_eq!(
            doc.routing.rules[0].domain.as_deref(),
            Some(&["geosite:category-ads".to_string()][..])
        );
        assert_eq!(
            doc.routing.rules[4].ip.as_deref(),
            Some(&["geoip:ir".to_string()][..])
        );

        let options = BuildOptions {
            domestic_region: None,
            ..BuildOptions::default()
        };
        let doc = build(&[d], &options).unwrap();
        assert_eq!(doc.routing.rules.len(), 4);
    }

    #[test]
    fn inbound_is_local_socks_with_sniffing() {
        let d = descriptor(&format!("vless://{UUID}@example.com:443"));
        let doc = build(&[d], &BuildOptions::default()).unwrap();
        assert_eq!(doc.inbounds.len(), 1);
        let inbound = &doc.inbounds[0];
        assert_eq!(inbound.listen, "127.0.0.1");
        assert_eq!(inbound.port, 10808);
        assert_eq!(inbound.protocol, "socks");
        assert!(inbound.settings.udp);
        assert_eq!(inbound.settings.auth, "noauth");
        assert!(inbound.sniffing.enabled);
        assert_eq!(doc.dns.servers, vec!["1.1.1.1", "8.8.8.8"]);
    }

    #[test]
    fn plain_tcp_gets_fake_http_header() {
        let d = descriptor(&format!("vless://{UUID}@example.com:80?host=cdn.example.com"));
        let doc = build(&[d], &BuildOptions::default()).unwrap();
        let stream = doc.outbounds[0].stream_settings.as_ref().unwrap();
        assert!(stream.tls_settings.is_none());
        let header = &stream.tcp_settings.as_ref().unwrap().header;
        assert_eq!(header.kind, "http");
        let request = header.request.as_ref().unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, vec!["/"]);
        assert_eq!(request.headers["Host"], vec!["cdn.example.com"]);
        assert_eq!(request.headers["Connection"], vec!["keep-alive"]);
    }

    #[test]
    fn tls_block_honours_allow_insecure_setting() {
        let d = descriptor(&format!(
            "vless://{UUID}@example.com:443?type=ws&path=/ray&alpn=h2"
        ));
        let options = BuildOptions {
            allow_insecure: false,
            ..BuildOptions::default()
        };
        let doc = build(&[d], &options).unwrap();
        let stream = doc.outbounds[0].stream_settings.as_ref().unwrap();
        let tls = stream.tls_settings.as_ref().unwrap();
        assert!(!tls.allow_insecure);
        assert_eq!(tls.server_name, "example.com");
        assert_eq!(tls.alpn, Some(vec!["h2".to_string()]));
        let ws = stream.ws_settings.as_ref().unwrap();
        assert_eq!(ws.path, "/ray");
        assert_eq!(ws.headers["Host"], "example.com");
        assert!(stream.tcp_settings.is_none());
    }

    #[test]
    fn trojan_always_carries_tls_block() {
        let d = descriptor("trojan://pw@tr.example.com:80?security=none#t");
        let doc = build(&[d], &BuildOptions::default()).unwrap();
        let stream = doc.outbounds[0].stream_settings.as_ref().unwrap();
        assert_eq!(stream.security, Security::None);
        assert!(stream.tls_settings.as_ref().unwrap().allow_insecure);
        match &doc.outbounds[0].settings {
            OutboundSettings::Servers { servers } => assert_eq!(servers[0].password, "pw"),
            other => panic!("unexpected settings {other:?}"),
        }
    }

    #[test]
    fn serialized_field_names_match_engine_schema() {
        let d = descriptor(&format!("vless://{UUID}@example.com:443?type=grpc&serviceName=svc"));
        let doc = build(&[d], &BuildOptions::default()).unwrap();
        let value = serde_json::to_value(&doc).unwrap();

        assert_eq!(value["routing"]["domainStrategy"], "IPIfNonMatch");
        assert_eq!(value["routing"]["rules"][0]["type"], "field");
        assert_eq!(value["routing"]["rules"][0]["outboundTag"], "blocked");
        assert_eq!(value["inbounds"][0]["sniffing"]["destOverride"][1], "tls");
        let outbound = &value["outbounds"][0];
        assert_eq!(outbound["protocol"], "vless");
        assert_eq!(outbound["streamSettings"]["network"], "grpc");
        assert_eq!(outbound["streamSettings"]["security"], "tls");
        assert_eq!(outbound["streamSettings"]["grpcSettings"]["serviceName"], "svc");
        assert_eq!(outbound["streamSettings"]["tlsSettings"]["allowInsecure"], true);
        assert_eq!(outbound["settings"]["vnext"][0]["users"][0]["encryption"], "none");
        assert_eq!(value["outbounds"][1]["settings"], serde_json::json!({}));
    }

    #[test]
    fn writer_uses_a_fresh_file_per_call() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = ConfigWriter::new(tmp.path().join("xray").join("configs")).unwrap();
        let d = descriptor(&format!("vless://{UUID}@example.com:443#w"));
        let doc = build(&[d], &BuildOptions::default()).unwrap();

        let first = writer.write(&doc).unwrap();
        let second = writer.write(&doc).unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with(writer.dir()));
        assert_eq!(read_config(&first).unwrap(), doc);
    }
}
