//! Redundant-transfer analysis.
//!
//! Observed peer moves are accumulated as edge weights on a directed graph
//! between stores. `result` splits that flow into a cyclic part (moves that
//! cancel each other out, "redundant") and the acyclic residue ("necessary").
//!
//! The decomposition is a greedy DFS. Each cycle is anchored at its smallest
//! vertex index, drained by its bottleneck weight `m`, and credited `m * len`
//! redundant moves. The answer depends only on the edge counts, so the same
//! move multiset always yields the same split.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub type StoreId = u64;
pub type RegionId = u64;

#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("region {region_id}: source store {source_store} committed without a staged target")]
    UnstagedSource {
        region_id: RegionId,
        source_store: StoreId,
    },
}

/// One drained cycle, listed by store id with the anchor repeated at the end.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cycle {
    pub stores: Vec<StoreId>,
    /// Moves drained from the graph by this cycle (`bottleneck * length`).
    pub weight: u64,
}

/// Output of one decomposition run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// Touched stores, ascending. Row/column `i` of the matrices is `stores[i]`.
    pub stores: Vec<StoreId>,
    pub matrix: Vec<Vec<u64>>,
    pub residual: Vec<Vec<u64>>,
    pub cycles: Vec<Cycle>,
    pub redundant: u64,
    pub necessary: u64,
    /// Distinct regions that contributed at least one committed move.
    pub region_count: usize,
}

impl TransferSummary {
    pub fn total_moves(&self) -> u64 {
        self.redundant + self.necessary
    }

    /// Writes the matrix, the recorded cycles and the final split.
    pub fn write_report<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "Transfer graph ({} stores)", self.stores.len())?;
        write!(out, "{:>8}", "")?;
        for id in &self.stores {
            write!(out, "{id:>8}")?;
        }
        writeln!(out)?;
        for (row, id) in self.matrix.iter().zip(&self.stores) {
            write!(out, "{id:>8}")?;
            for count in row {
                write!(out, "{count:>8}")?;
            }
            writeln!(out)?;
        }
        if !self.cycles.is_empty() {
            writeln!(out, "Cycles:")?;
            for cycle in &self.cycles {
                let path: Vec<String> = cycle.stores.iter().map(|s| s.to_string()).collect();
                writeln!(out, "  {} (weight {})", path.join(" -> "), cycle.weight)?;
            }
        }
        writeln!(
            out,
            "Redundant: {}, Necessary: {}",
            self.redundant, self.necessary
        )
    }
}

#[derive(Debug, Default)]
struct Inner {
    pending: HashMap<RegionId, StoreId>,
    edges: BTreeMap<(StoreId, StoreId), u64>,
    regions: BTreeSet<RegionId>,
    // Decomposition work area.
    stores: Vec<StoreId>,
    graph: Vec<Vec<u64>>,
    visited: Vec<bool>,
    path: Vec<usize>,
    cycles: Vec<Cycle>,
    redundant: u64,
}

impl Inner {
    /// Rebuilds the dense matrix from the edge counts.
    fn prepare(&mut self) {
        let mut stores = BTreeSet::new();
        for (source, target) in self.edges.keys() {
            stores.insert(*source);
            stores.insert(*target);
        }
        self.stores = stores.into_iter().collect();
        let index: HashMap<StoreId, usize> = self
            .stores
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();

        let n = self.stores.len();
        self.graph = vec![vec![0; n]; n];
        for ((source, target), count) in &self.edges {
            self.graph[index[source]][index[target]] += *count;
        }
        self.visited = vec![false; n];
        self.path.clear();
        self.cycles.clear();
        self.redundant = 0;
    }

    fn decompose(&mut self) {
        for start in 0..self.stores.len() {
            self.dfs(start);
        }
    }

    fn dfs(&mut self, u: usize) {
        self.path.push(u);
        self.visited[u] = true;
        let anchor = self.path[0];
        for v in anchor..self.stores.len() {
            if self.graph[u][v] == 0 {
                continue;
            }
            if v == anchor {
                self.close_cycle(u, v);
            } else if !self.visited[v] {
                self.dfs(v);
            }
        }
        self.visited[u] = false;
        self.path.pop();
    }

    fn close_cycle(&mut self, u: usize, v: usize) {
        let bottleneck = self
            .path
            .windows(2)
            .map(|w| self.graph[w[0]][w[1]])
            .fold(self.graph[u][v], u64::min);
        if bottleneck == 0 {
            return;
        }
        for i in 0..self.path.len().saturating_sub(1) {
            let (a, b) = (self.path[i], self.path[i + 1]);
            self.graph[a][b] -= bottleneck;
        }
        self.graph[u][v] -= bottleneck;

        let weight = bottleneck * self.path.len() as u64;
        // Copy the path: the buffer keeps changing after this call.
        let mut stores: Vec<StoreId> = self.path.iter().map(|i| self.stores[*i]).collect();
        stores.push(self.stores[v]);
        self.cycles.push(Cycle { stores, weight });
        self.redundant += weight;
    }

    fn summary(&self, matrix: Vec<Vec<u64>>) -> TransferSummary {
        let necessary = self.graph.iter().flatten().sum();
        TransferSummary {
            stores: self.stores.clone(),
            matrix,
            residual: self.graph.clone(),
            cycles: self.cycles.clone(),
            redundant: self.redundant,
            necessary,
            region_count: self.regions.len(),
        }
    }
}

/// Accumulates moves and computes the redundant/necessary split.
///
/// A move is recorded in two phases mirroring the cluster protocol: the new
/// peer is added (`add_target`) before the old one is removed (`add_source`).
#[derive(Debug, Default)]
pub struct TransferCounter {
    inner: Mutex<Inner>,
}

impl TransferCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the counter from a dense matrix; row `i` is store `i + 1`.
    pub fn from_matrix(matrix: &[Vec<u64>]) -> Self {
        let counter = Self::new();
        {
            let mut inner = counter.lock();
            for (i, row) in matrix.iter().enumerate() {
                for (j, count) in row.iter().enumerate() {
                    if *count > 0 {
                        inner.edges.insert((i as u64 + 1, j as u64 + 1), *count);
                    }
                }
            }
        }
        counter
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stages `target` as the destination of the next move of `region_id`.
    pub fn add_target(&self, region_id: RegionId, target: StoreId) {
        self.lock().pending.insert(region_id, target);
    }

    /// Commits the staged move of `region_id` as an edge `source -> target`.
    pub fn add_source(&self, region_id: RegionId, source: StoreId) -> Result<(), AnalyzerError> {
        let mut inner = self.lock();
        let Some(target) = inner.pending.remove(&region_id) else {
            return Err(AnalyzerError::UnstagedSource {
                region_id,
                source_store: source,
            });
        };
        *inner.edges.entry((source, target)).or_default() += 1;
        inner.regions.insert(region_id);
        Ok(())
    }

    /// Stages and commits one move.
    pub fn record_move(
        &self,
        region_id: RegionId,
        source: StoreId,
        target: StoreId,
    ) -> Result<(), AnalyzerError> {
        self.add_target(region_id, target);
        self.add_source(region_id, source)
    }

    /// Staged targets still waiting for their source.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Committed moves so far.
    pub fn total_moves(&self) -> u64 {
        self.lock().edges.values().sum()
    }

    /// Runs the decomposition over every committed move.
    ///
    /// The matrix is rebuilt from the edge counts on each call, so repeated
    /// calls return identical totals.
    pub fn result(&self) -> TransferSummary {
        let mut inner = self.lock();
        inner.prepare();
        let matrix = inner.graph.clone();
        inner.decompose();
        let summary = inner.summary(matrix);
        tracing::debug!(
            stores = summary.stores.len(),
            cycles = summary.cycles.len(),
            redundant = summary.redundant,
            necessary = summary.necessary,
            "transfer decomposition finished"
        );
        summary
    }

    /// Runs [`TransferCounter::result`] and writes the report to `out`.
    pub fn print_result<W: Write>(&self, out: &mut W) -> io::Result<TransferSummary> {
        let summary = self.result();
        summary.write_report(out)?;
        Ok(summary)
    }
}

/// `storeNum,regionNum,redundant,necessary` line.
pub fn result_line(store_num: usize, region_num: usize, summary: &TransferSummary) -> String {
    format!(
        "{store_num},{region_num},{},{}\n",
        summary.redundant, summary.necessary
    )
}

/// Appends `line` to `path`, creating the file when missing.
pub fn append_result_line(path: &Path, line: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.flush()
}
