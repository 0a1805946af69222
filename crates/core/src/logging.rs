//! Filter selection, the rolling file sink and the credential-masking writer
//! used by the binary when it installs its subscriber.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use tracing::Metadata;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriter;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "hyper=warn,hyper_util=warn,reqwest=warn,h2=warn";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const LOG_FILE_PREFIX: &str = "tumorscan";
pub const LOG_FILE_SUFFIX: &str = "log";
pub const MASK: &str = "***";

/// Probe results only show at debug; the file keeps them even when the
/// console is quiet.
const FILE_DEBUG_TARGETS: [&str; 2] = ["tumorscan_core::monitor", "tumorscan_core::predictor"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    /// What the user asked for, before noise directives are merged in.
    pub requested: String,
    pub console: String,
    pub file: String,
}

#[derive(Debug)]
pub enum FileSink {
    Ready {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    /// Logging continues on the console only.
    Unavailable {
        log_dir: Option<PathBuf>,
        reason: String,
    },
}

pub fn compose_filters(options: &LoggingOptions) -> LogFilters {
    let requested = if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        options.default_log_filter.clone()
    };

    let implicit = options.cli_log_filter.is_none() && options.verbose == 0;
    let noise = options.noise_filter.trim();
    if !implicit || noise.is_empty() {
        return LogFilters {
            console: requested.clone(),
            file: requested.clone(),
            requested,
        };
    }

    let mut file_directives: Vec<String> = noise.split(',').map(str::to_string).collect();
    file_directives.extend(FILE_DEBUG_TARGETS.iter().map(|target| format!("{target}=debug")));

    LogFilters {
        console: format!("{noise},{requested}"),
        file: format!("{},{requested}", file_directives.join(",")),
        requested,
    }
}

pub fn open_file_sink(options: &LoggingOptions) -> FileSink {
    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSink::Unavailable {
            log_dir: None,
            reason: "no data directory configured".to_string(),
        };
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSink::Unavailable {
            log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let retention = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(retention)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSink::Ready { log_dir, appender },
        Err(error) => FileSink::Unavailable {
            log_dir: Some(log_dir),
            reason: format!("failed to open rolling log file: {error}"),
        },
    }
}

/// Replaces the `user:password@` part of every URL in `line` with [`MASK`].
pub fn mask_url_credentials(line: &str) -> String {
    let mut masked = String::with_capacity(line.len());
    let mut rest = line;

    while let Some(scheme_end) = rest.find("://") {
        let host_start = scheme_end + 3;
        let authority_len = rest[host_start..]
            .find(|ch: char| ch.is_whitespace() || "/?#\"'<>".contains(ch))
            .unwrap_or(rest.len() - host_start);
        let authority = &rest[host_start..host_start + authority_len];

        masked.push_str(&rest[..host_start]);
        match authority.rfind('@') {
            Some(at) if at > 0 => {
                masked.push_str(MASK);
                masked.push_str(&authority[at..]);
            }
            _ => masked.push_str(authority),
        }
        rest = &rest[host_start + authority_len..];
    }

    masked.push_str(rest);
    masked
}

/// `MakeWriter` adapter that masks URL credentials line by line.
#[derive(Debug)]
pub struct MaskingMakeWriter<M> {
    inner: M,
}

impl<M> MaskingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M> MakeWriter<'a> for MaskingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = MaskingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        MaskingWriter::new(self.inner.make_writer())
    }

    fn make_writer_for(&'a self, metadata: &Metadata<'_>) -> Self::Writer {
        MaskingWriter::new(self.inner.make_writer_for(metadata))
    }
}

#[derive(Debug)]
pub struct MaskingWriter<W: Write> {
    inner: W,
    line: Vec<u8>,
}

impl<W: Write> MaskingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            line: Vec::new(),
        }
    }

    fn emit(&mut self, upto: usize) -> io::Result<()> {
        let chunk: Vec<u8> = self.line.drain(..upto).collect();
        let masked = mask_url_credentials(&String::from_utf8_lossy(&chunk));
        self.inner.write_all(masked.as_bytes())
    }
}

impl<W: Write> Write for MaskingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.line.extend_from_slice(buf);
        while let Some(newline) = self.line.iter().position(|byte| *byte == b'\n') {
            self.emit(newline + 1)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.line.is_empty() {
            self.emit(self.line.len())?;
        }
        self.inner.flush()
    }
}

impl<W: Write> Drop for MaskingWriter<W> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
