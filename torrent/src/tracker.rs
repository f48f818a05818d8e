use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use bytes::Buf;
use serde::de;
use serde_derive::Deserialize;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bencode error whilst decoding response: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("tracker responded with failure: {0}")]
    Failure(String),
}

pub type Result<T> = std::result::Result<T, TrackerError>;

const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct AnnounceParams {

    pub info_hash: [u8; 20],

    pub peer_id: [u8; 20],

    // Port we advertise for inbound peers.
    pub port: u16,

    pub uploaded: u64,

    pub downloaded: u64,

    pub left: u64,

}

// Blocking tracker announce, run at task construction time. The reactor is
// not driving these sockets yet, so the stall is deliberate and contained.
pub fn announce(url: &Url, params: &AnnounceParams) -> Result<Vec<SocketAddr>> {
    let query = format!(
        "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=0",
        url.as_str(),
        urlencoding::encode_binary(&params.info_hash),
        urlencoding::encode_binary(&params.peer_id),
        params.port,
        params.uploaded,
        params.downloaded,
        params.left,
    );
    tracing::debug!("announce url: {}", query);

    let client = reqwest::blocking::Client::builder()
        .timeout(ANNOUNCE_TIMEOUT)
        .build()?;
    let raw = client.get(query).send()?.bytes()?;

    let response: AnnounceResponse = serde_bencode::from_bytes(&raw)?;
    tracing::debug!("announce response: {:?}", response);

    if let Some(reason) = response.failure_reason {
        return Err(TrackerError::Failure(reason));
    }
    if let Some(warning) = response.warning_message {
        tracing::warn!("tracker warning: {}", warning);
    }
    Ok(response.peers)
}

#[derive(Deserialize, Debug, Default)]
pub struct AnnounceResponse {

    // If present no other key matters; a human readable error.
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,

    // Processed normally, shown like an error.
    #[serde(rename = "warning message")]
    pub warning_message: Option<String>,

    // Seconds to wait between regular announces.
    pub interval: Option<u64>,

    // Seeder count.
    pub complete: Option<u64>,

    // Leecher count.
    pub incomplete: Option<u64>,

    #[serde(default)]
    #[serde(deserialize_with = "deserialize_peers")]
    pub peers: Vec<SocketAddr>,

}

// Trackers answer with either the compact 6-byte-per-peer string (4 bytes
// IPv4, 2 bytes port, both big-endian) or a list of {ip, port}
// dictionaries, regardless of what the request asked for.
fn deserialize_peers<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeersVisitor;

    impl<'de> de::Visitor<'de> for PeersVisitor {

        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a compact peer string or a list of peer dictionaries")
        }

        fn visit_bytes<E>(self, mut v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                return Err(E::custom("compact peer string not a multiple of 6"));
            }
            let mut peers = Vec::with_capacity(v.len() / 6);
            while v.remaining() >= 6 {
                let ip = Ipv4Addr::from(v.get_u32());
                let port = v.get_u16();
                peers.push(SocketAddr::new(IpAddr::V4(ip), port));
            }
            Ok(peers)
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct PeerEntry {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(entry) = seq.next_element::<PeerEntry>()? {
                match entry.ip.parse::<IpAddr>() {
                    Ok(ip) => peers.push(SocketAddr::new(ip, entry.port)),
                    Err(_) => continue,
                }
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeersVisitor)
}
