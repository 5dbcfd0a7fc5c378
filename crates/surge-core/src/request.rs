use anyhow::{anyhow, bail, Context, Result};
use http::Uri;

pub const UNIX_PATH_PREFIX: &str = "unix:";

/// Scheme/host/port taken from the first URI. Subsequent URIs contribute
/// only their request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseUri {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub default_port: u16,
}

impl BaseUri {
    /// `host[:port]`, with the port omitted when it is the scheme default.
    pub fn authority(&self) -> String {
        if self.port != self.default_port {
            format!("{}:{}", self.host, self.port)
        } else {
            self.host.clone()
        }
    }
}

fn default_port_for(scheme: &str) -> Result<u16> {
    match scheme {
        "http" => Ok(80),
        "https" => Ok(443),
        other => Err(anyhow!("unsupported scheme: {other}")),
    }
}

pub fn parse_base_uri(uri: &str) -> Result<BaseUri> {
    let parsed: Uri = uri.parse().with_context(|| format!("invalid URI: {uri}"))?;
    let scheme = parsed
        .scheme_str()
        .ok_or_else(|| anyhow!("invalid URI: {uri}"))?
        .to_string();
    let authority = parsed
        .authority()
        .ok_or_else(|| anyhow!("invalid URI: {uri}"))?;
    let host = authority.host().to_string();
    let default_port = default_port_for(&scheme)?;
    let port = authority.port_u16().unwrap_or(default_port);

    Ok(BaseUri {
        scheme,
        host,
        port,
        default_port,
    })
}

/// Path plus optional query; `/` when the URI carries no path.
pub fn reqline(uri: &str) -> Result<String> {
    let parsed: Uri = uri.parse().with_context(|| format!("invalid URI: {uri}"))?;
    Ok(parsed
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string()))
}

/// First URI defines the base; every URI contributes a request line.
/// A `unix:PATH` base is returned through the path in `BaseUri.host` with
/// scheme `http` semantics left to the caller.
pub fn parse_uris(uris: &[String]) -> Result<(BaseUri, Vec<String>)> {
    let first = uris.first().ok_or_else(|| anyhow!("no URI given"))?;
    let base = parse_base_uri(first)?;

    let mut reqlines = Vec::with_capacity(uris.len());
    for uri in uris {
        reqlines.push(reqline(uri)?);
    }

    Ok((base, reqlines))
}

/// Header names whose `-H` occurrences replace the shared value instead of
/// appending. `:host` is an alias that lands on `:authority`.
const OVERRIDE_HDRS: [&str; 5] = [":authority", ":host", ":method", ":scheme", "user-agent"];

/// Build the shared pseudo-header/header set: `:scheme`, `:authority`,
/// `:method` (POST when a body is configured), `user-agent`, custom
/// headers merged per the override rules, and `content-length` when a
/// body is configured.
pub fn build_shared_headers(
    base: &BaseUri,
    body_len: Option<usize>,
    user_agent: &str,
    custom: &[(String, String)],
) -> Vec<(String, String)> {
    let mut shared: Vec<(String, String)> = vec![
        (":scheme".to_string(), base.scheme.clone()),
        (":authority".to_string(), base.authority()),
        (
            ":method".to_string(),
            if body_len.is_some() { "POST" } else { "GET" }.to_string(),
        ),
        ("user-agent".to_string(), user_agent.to_string()),
    ];

    for (name, value) in custom {
        let name = name.to_ascii_lowercase();
        if OVERRIDE_HDRS.contains(&name.as_str()) {
            for (shared_name, shared_value) in shared.iter_mut() {
                let aliased = shared_name == ":authority" && name == ":host";
                if aliased || *shared_name == name {
                    *shared_value = value.clone();
                }
            }
        } else {
            shared.push((name, value.clone()));
        }
    }

    if let Some(len) = body_len {
        shared.push(("content-length".to_string(), len.to_string()));
    }

    shared
}

/// Parse one `-H NAME:VALUE` argument. A leading `:` in the name is part
/// of the pseudo-header and not a separator.
pub fn parse_header_arg(arg: &str) -> Result<(String, String)> {
    if arg.is_empty() {
        bail!("-H: invalid header: {arg}");
    }
    let sep = arg[1..]
        .find(':')
        .map(|i| i + 1)
        .ok_or_else(|| anyhow!("-H: invalid header: {arg}"))?;
    let name = &arg[..sep];
    let value = arg[sep + 1..].trim_start();
    if name.is_empty() || name == ":" {
        bail!("-H: invalid header: {arg}");
    }
    if value.is_empty() {
        bail!("-H: invalid header - value missing: {arg}");
    }
    Ok((name.to_ascii_lowercase(), value.to_string()))
}
