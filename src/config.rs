use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

/// Process settings, read from `BAYFLOW_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub staff_password: String,
    pub customer_password: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub reconcile_interval: Duration,
    /// How long an unseated appointment may sit `in_progress` before it is reported.
    pub stale_after: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            staff_password: "bayflow".into(),
            customer_password: "bayflow".into(),
            max_connections: 256,
            compact_threshold: 1000,
            reconcile_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(4 * 60 * 60),
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Malformed numbers are errors rather than silently defaulted.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let d = Config::default();
        Ok(Self {
            bind: lookup("BAYFLOW_BIND").unwrap_or(d.bind),
            port: parsed(&lookup, "BAYFLOW_PORT")?.unwrap_or(d.port),
            data_dir: lookup("BAYFLOW_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            staff_password: lookup("BAYFLOW_STAFF_PASSWORD").unwrap_or(d.staff_password),
            customer_password: lookup("BAYFLOW_CUSTOMER_PASSWORD").unwrap_or(d.customer_password),
            max_connections: parsed(&lookup, "BAYFLOW_MAX_CONNECTIONS")?.unwrap_or(d.max_connections),
            compact_threshold: parsed(&lookup, "BAYFLOW_COMPACT_THRESHOLD")?.unwrap_or(d.compact_threshold),
            reconcile_interval: parsed_period(&lookup, "BAYFLOW_RECONCILE_INTERVAL_SECS")?
                .unwrap_or(d.reconcile_interval),
            stale_after: parsed(&lookup, "BAYFLOW_STALE_AFTER_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(d.stale_after),
            metrics_port: parsed(&lookup, "BAYFLOW_METRICS_PORT")?,
            tls_cert: lookup("BAYFLOW_TLS_CERT"),
            tls_key: lookup("BAYFLOW_TLS_KEY"),
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bayflow.wal")
    }

    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        load_tls_acceptor(self.tls_cert.as_deref(), self.tls_key.as_deref())
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> io::Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, format!("{key}: cannot parse {raw:?}"))),
    }
}

/// A timer period in whole seconds. Zero is malformed: a timer cannot tick every 0s.
fn parsed_period(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> io::Result<Option<Duration>> {
    match parsed::<u64>(lookup, key)? {
        Some(0) => Err(io::Error::new(ErrorKind::InvalidInput, format!("{key}: must be at least 1 second"))),
        secs => Ok(secs.map(Duration::from_secs)),
    }
}

pub fn load_tls_acceptor(cert_path: Option<&str>, key_path: Option<&str>) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both BAYFLOW_TLS_CERT and BAYFLOW_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs: Vec<_> =
        rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?)).collect::<Result<_, _>>()?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}
