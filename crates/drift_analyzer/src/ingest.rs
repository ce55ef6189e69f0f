//! Operator log ingestion.
//!
//! Each line is checked for a `YYYY/MM/DD HH:MM:SS` timestamp, filtered by a
//! half-open time window, and matched against the "operator finish" pattern
//! of one operator kind. Matches become moves on a [`TransferCounter`].

use std::fmt;
use std::io::BufRead;
use std::str::FromStr;

use chrono::NaiveDateTime;
use regex::Regex;

use crate::transfer::{AnalyzerError, RegionId, StoreId, TransferCounter};

pub const TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("unsupported operator `{0}`")]
    UnsupportedOperator(String),
    #[error("invalid time bound `{0}`, expected YYYY/MM/DD HH:MM:SS")]
    BadTimeBound(String),
    #[error("line {line}: malformed numeric field `{value}`")]
    BadNumber { line: usize, value: String },
    #[error("failed to build operator pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("failed to read log: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
}

/// Operator kinds whose finished moves can be analyzed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Operator {
    BalanceRegion,
    BalanceLeader,
    TransferHotReadLeader,
    MoveHotReadRegion,
    TransferHotWriteLeader,
    MoveHotWriteRegion,
}

impl Operator {
    pub const ALL: [Operator; 6] = [
        Operator::BalanceRegion,
        Operator::BalanceLeader,
        Operator::TransferHotReadLeader,
        Operator::MoveHotReadRegion,
        Operator::TransferHotWriteLeader,
        Operator::MoveHotWriteRegion,
    ];

    /// Name as it appears in operator descriptions.
    pub fn name(self) -> &'static str {
        match self {
            Operator::BalanceRegion => "balance-region",
            Operator::BalanceLeader => "balance-leader",
            Operator::TransferHotReadLeader => "transfer-hot-read-leader",
            Operator::MoveHotReadRegion => "move-hot-read-region",
            Operator::TransferHotWriteLeader => "transfer-hot-write-leader",
            Operator::MoveHotWriteRegion => "move-hot-write-region",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operator {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operator::ALL
            .into_iter()
            .find(|op| op.name() == s)
            .ok_or_else(|| IngestError::UnsupportedOperator(s.to_string()))
    }
}

/// Half-open `[start, end)` window; a missing bound is unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
}

impl TimeWindow {
    /// Parses both bounds; empty strings leave that side open.
    pub fn parse(start: &str, end: &str) -> Result<Self, IngestError> {
        Ok(Self {
            start: parse_bound(start)?,
            end: parse_bound(end)?,
        })
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        self.start.map_or(true, |s| ts >= s) && self.end.map_or(true, |e| ts < e)
    }
}

fn parse_bound(raw: &str) -> Result<Option<NaiveDateTime>, IngestError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    NaiveDateTime::parse_from_str(raw, TIME_FORMAT)
        .map(Some)
        .map_err(|_| IngestError::BadTimeBound(raw.to_string()))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Move {
    pub region_id: RegionId,
    pub source: StoreId,
    pub target: StoreId,
}

/// Classification of a single log line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LineOutcome {
    NoTimestamp,
    /// Looked like a timestamp but did not parse.
    BadTimestamp(String),
    OutOfWindow,
    NoMatch,
    Move(Move),
}

/// Counters reported after a full ingestion pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub lines: usize,
    pub moves: usize,
    pub out_of_window: usize,
    pub bad_timestamps: usize,
    pub skipped: usize,
}

pub struct LogIngester {
    operator: Operator,
    window: TimeWindow,
    time_re: Regex,
    op_re: Regex,
}

impl LogIngester {
    pub fn new(operator: Operator, window: TimeWindow) -> Result<Self, IngestError> {
        let time_re = Regex::new(r"\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}")?;
        // Store ids may be bracketed (`store [4] to [6]`) depending on the
        // operator step that logged them.
        let op_re = Regex::new(&format!(
            r".*?operator finish.*?region-id=(\d+).*?{}.*?store \[?(\d+)\]? to \[?(\d+)\]?",
            regex::escape(operator.name())
        ))?;
        Ok(Self {
            operator,
            window,
            time_re,
            op_re,
        })
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    /// Classifies one line. `line_no` is 1-based and only used in errors.
    pub fn parse_line(&self, line_no: usize, line: &str) -> Result<LineOutcome, IngestError> {
        let Some(ts) = self.time_re.find(line) else {
            return Ok(LineOutcome::NoTimestamp);
        };
        let ts = match NaiveDateTime::parse_from_str(ts.as_str(), TIME_FORMAT) {
            Ok(ts) => ts,
            Err(_) => return Ok(LineOutcome::BadTimestamp(ts.as_str().to_string())),
        };
        if !self.window.contains(ts) {
            return Ok(LineOutcome::OutOfWindow);
        }
        let Some(caps) = self.op_re.captures(line) else {
            return Ok(LineOutcome::NoMatch);
        };
        let field = |i: usize| -> Result<u64, IngestError> {
            let value = caps.get(i).map_or("", |m| m.as_str());
            value.parse().map_err(|_| IngestError::BadNumber {
                line: line_no,
                value: value.to_string(),
            })
        };
        Ok(LineOutcome::Move(Move {
            region_id: field(1)?,
            source: field(2)?,
            target: field(3)?,
        }))
    }

    /// Reads every line of `reader` and records matched moves on `counter`.
    pub fn ingest<R: BufRead>(
        &self,
        reader: R,
        counter: &TransferCounter,
    ) -> Result<IngestSummary, IngestError> {
        let mut summary = IngestSummary::default();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            summary.lines += 1;
            match self.parse_line(idx + 1, &line)? {
                LineOutcome::Move(mv) => {
                    counter.add_target(mv.region_id, mv.target);
                    counter.add_source(mv.region_id, mv.source)?;
                    summary.moves += 1;
                }
                LineOutcome::BadTimestamp(raw) => {
                    tracing::warn!(line = idx + 1, timestamp = %raw, "unparseable timestamp");
                    summary.bad_timestamps += 1;
                }
                LineOutcome::OutOfWindow => summary.out_of_window += 1,
                LineOutcome::NoTimestamp | LineOutcome::NoMatch => summary.skipped += 1,
            }
        }
        tracing::info!(
            operator = %self.operator,
            lines = summary.lines,
            moves = summary.moves,
            out_of_window = summary.out_of_window,
            "log ingested"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEADER_LINE: &str = r#"[2019/09/05 04:15:52.404 +00:00] [INFO] [operator_controller.go:119] ["operator finish"] [region-id=54252] [operator=""balance-leader {transfer leader: store 4 to 6} (kind:leader,balance, region:54252(1362,6), createAt:2019-09-05 04:15:52.401 +0000 UTC, currentStep:1, steps:[transfer leader from store 4 to store 6]) finished""]"#;

    fn ingester(op: Operator, start: &str, end: &str) -> LogIngester {
        LogIngester::new(op, TimeWindow::parse(start, end).unwrap()).unwrap()
    }

    #[test]
    fn extracts_balance_leader_move() {
        let outcome = ingester(Operator::BalanceLeader, "", "")
            .parse_line(1, LEADER_LINE)
            .unwrap();
        assert_eq!(
            outcome,
            LineOutcome::Move(Move {
                region_id: 54252,
                source: 4,
                target: 6
            })
        );
    }

    #[test]
    fn window_is_half_open() {
        let inside = ingester(
            Operator::BalanceLeader,
            "2019/09/05 04:00:00",
            "2019/09/05 05:00:00",
        );
        assert!(matches!(
            inside.parse_line(1, LEADER_LINE).unwrap(),
            LineOutcome::Move(_)
        ));

        let before = ingester(Operator::BalanceLeader, "2019/09/05 05:00:00", "");
        assert_eq!(
            before.parse_line(1, LEADER_LINE).unwrap(),
            LineOutcome::OutOfWindow
        );

        let at_end = ingester(Operator::BalanceLeader, "", "2019/09/05 04:15:52");
        assert_eq!(
            at_end.parse_line(1, LEADER_LINE).unwrap(),
            LineOutcome::OutOfWindow
        );
    }

    #[test]
    fn other_operator_does_not_match() {
        let outcome = ingester(Operator::BalanceRegion, "", "")
            .parse_line(1, LEADER_LINE)
            .unwrap();
        assert_eq!(outcome, LineOutcome::NoMatch);
    }

    #[test]
    fn bracketed_store_ids_are_accepted() {
        let line = r#"[2019/09/05 04:20:01.000 +00:00] [INFO] ["operator finish"] [region-id=12] [operator="balance-region {mv peer: store [1] to [3]}"]"#;
        let outcome = ingester(Operator::BalanceRegion, "", "")
            .parse_line(1, line)
            .unwrap();
        assert_eq!(
            outcome,
            LineOutcome::Move(Move {
                region_id: 12,
                source: 1,
                target: 3
            })
        );
    }

    #[test]
    fn invalid_calendar_date_is_soft_error() {
        let line = "[2019/13/45 04:15:52.404] operator finish region-id=1 balance-leader store 1 to 2";
        let outcome = ingester(Operator::BalanceLeader, "", "")
            .parse_line(1, line)
            .unwrap();
        assert!(matches!(outcome, LineOutcome::BadTimestamp(_)));
    }

    #[test]
    fn overflowing_region_id_is_fatal() {
        let line = "[2019/09/05 04:15:52] operator finish region-id=99999999999999999999999 balance-leader store 1 to 2";
        let err = ingester(Operator::BalanceLeader, "", "")
            .parse_line(7, line)
            .unwrap_err();
        assert!(matches!(err, IngestError::BadNumber { line: 7, .. }));
    }

    #[test]
    fn operator_names_round_trip() {
        for op in Operator::ALL {
            assert_eq!(op.name().parse::<Operator>().unwrap(), op);
        }
        assert!(matches!(
            "balance-hot".parse::<Operator>(),
            Err(IngestError::UnsupportedOperator(_))
        ));
    }

    #[test]
    fn bad_bound_is_rejected() {
        assert!(matches!(
            TimeWindow::parse("2019-09-05", ""),
            Err(IngestError::BadTimeBound(_))
        ));
    }

    #[test]
    fn ingest_feeds_counter() {
        let log = format!(
            "{LEADER_LINE}\nnoise without time\n{}\n",
            LEADER_LINE
                .replace("54252", "54253")
                .replace("store 4 to 6", "store 6 to 4")
        );
        let counter = TransferCounter::new();
        let summary = ingester(Operator::BalanceLeader, "", "")
            .ingest(log.as_bytes(), &counter)
            .unwrap();
        assert_eq!(summary.lines, 3);
        assert_eq!(summary.moves, 2);
        assert_eq!(summary.skipped, 1);
        let result = counter.result();
        assert_eq!((result.redundant, result.necessary), (2, 0));
    }
}
