//! Runs the path pairs of one inventory node over a shared session.
//!
//! Pairs run concurrently up to a limit. A failing pair does not stop the others; every failure
//! is collected into the [`Report`].

use crate::{Error, Summary};
use common::config::{Direction, DirPair};
use common::progress::ProgressBoard;
use futures::StreamExt;
use remote::{Session, Transport};

#[derive(Debug)]
pub struct Failure {
    pub pair: DirPair,
    pub error: Error,
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "local:[{}] remote:[{}]: {}",
            self.pair.local, self.pair.remote, self.error
        )
    }
}

/// Outcome of all pairs of a batch.
#[derive(Debug, Default)]
pub struct Report {
    pub summary: Summary,
    pub succeeded: usize,
    pub failures: Vec<Failure>,
}

impl Report {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(
            f,
            "{} succeeded, {} failed:",
            self.succeeded,
            self.failures.len()
        )?;
        for failure in &self.failures {
            writeln!(f, "  {failure}")?;
        }
        Ok(())
    }
}

fn label(pair: &DirPair, direction: Direction) -> String {
    match direction {
        Direction::Put => format!("{} -> {}", pair.local, pair.remote),
        Direction::Get => format!("{} <- {}", pair.local, pair.remote),
    }
}

/// Transfers every pair in `pairs`, at most `max_parallel` at a time.
pub async fn run<T: Transport>(
    session: &Session<T>,
    pairs: &[DirPair],
    direction: Direction,
    max_parallel: usize,
    board: &ProgressBoard,
    cancel: &tokio_util::sync::CancellationToken,
) -> Report {
    let results = futures::stream::iter(pairs.iter().cloned())
        .map(|pair| async move {
            tracing::info!("local:[{}] remote:[{}]", &pair.local, &pair.remote);
            let progress = board.transfer(&label(&pair, direction));
            let result = crate::transfer(
                session,
                &pair.local,
                &pair.remote,
                direction,
                cancel,
                &*progress,
            )
            .await;
            progress.finish(result.is_ok());
            (pair, result)
        })
        .buffer_unordered(max_parallel.max(1))
        .collect::<Vec<_>>()
        .await;
    let mut report = Report::default();
    for (pair, result) in results {
        match result {
            Ok(summary) => {
                tracing::debug!("{}: done", label(&pair, direction));
                report.summary = report.summary + summary;
                report.succeeded += 1;
            }
            Err(error) => {
                tracing::error!("local:[{}] remote:[{}]: {}", &pair.local, &pair.remote, &error);
                report.failures.push(Failure { pair, error });
            }
        }
    }
    report
}
