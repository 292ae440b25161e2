use std::path::Path;

use models::Tick;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::log::FeedError;
use crate::mem::MemLog;

/// Load newline-delimited JSON ticks from `path` ("-" for stdin) into
/// `log`, routing each to its symbol's partition. Returns the number of
/// ticks loaded.
pub async fn load_jsonl(path: &Path, log: &MemLog) -> Result<usize, FeedError> {
    let loaded = if path.as_os_str() == "-" {
        load_jsonl_reader(tokio::io::BufReader::new(tokio::io::stdin()), log).await?
    } else {
        let file = tokio::fs::File::open(path).await?;
        load_jsonl_reader(tokio::io::BufReader::new(file), log).await?
    };
    tracing::info!(path = %path.display(), ticks = loaded, "loaded tick feed");
    Ok(loaded)
}

/// Blank lines are skipped; a malformed line aborts the load so a truncated
/// or corrupt feed fails loudly instead of silently dropping ticks.
pub async fn load_jsonl_reader<R>(reader: R, log: &MemLog) -> Result<usize, FeedError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut loaded = 0;
    let mut line_no = 0;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let tick: Tick = serde_json::from_str(&line).map_err(|source| FeedError::Malformed {
            line: line_no,
            source,
        })?;
        log.append(tick);
        loaded += 1;
    }
    Ok(loaded)
}
