// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Log collection helpers shared by the backends.

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

use crate::logger::{JobLogger, LogLine};

/// Split a runtime log line into its leading RFC 3339 timestamp and text.
fn parse_timestamped(line: &str) -> LogLine {
    let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
    match DateTime::parse_from_rfc3339(head) {
        Ok(ts) => LogLine {
            line: rest.to_string(),
            is_error: false,
            ts: Some(ts.with_timezone(&Utc)),
        },
        Err(_) => LogLine {
            line: line.to_string(),
            is_error: false,
            ts: None,
        },
    }
}

/// Merge timestamped stdout and stderr output into one chronological sequence.
///
/// Each line is expected to start with an RFC 3339 timestamp (as produced by
/// `docker logs --timestamps`). The sort is stable: lines with equal
/// timestamps keep their original order, stdout before stderr. Lines without
/// a parseable timestamp sort first.
pub fn sort_lines_by_time(stdout: &str, stderr: &str) -> Vec<LogLine> {
    let mut lines: Vec<LogLine> = stdout
        .lines()
        .filter(|l| !l.is_empty())
        .map(parse_timestamped)
        .chain(
            stderr
                .lines()
                .filter(|l| !l.is_empty())
                .map(|l| LogLine {
                    is_error: true,
                    ..parse_timestamped(l)
                }),
        )
        .collect();
    lines.sort_by_key(|l| l.ts);
    lines
}

async fn read_lines<R>(reader: R, is_error: bool, tx: mpsc::UnboundedSender<LogLine>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let line = if is_error {
            LogLine::stderr(line)
        } else {
            LogLine::stdout(line)
        };
        if tx.send(line).is_err() {
            break;
        }
    }
    Ok(())
}

/// Forward a child's stdout and stderr to the job log until both streams are
/// closed.
///
/// Both pipes keep being drained while a batch is being shipped. Each batch
/// holds every line read since the previous one, in the order lines became
/// readable.
pub async fn pump_output<O, E>(stdout: O, stderr: E, logger: &JobLogger) -> std::io::Result<()>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let ship = async {
        while let Some(line) = rx.recv().await {
            let mut batch = vec![line];
            while let Ok(line) = rx.try_recv() {
                batch.push(line);
            }
            logger.log_lines(batch).await;
        }
    };
    let (out, err, ()) = tokio::join!(
        read_lines(stdout, false, tx.clone()),
        read_lines(stderr, true, tx),
        ship
    );
    out?;
    err?;
    Ok(())
}
