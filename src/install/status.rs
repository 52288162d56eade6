// src/install/status.rs

//! Terminal dashboard for an installer run
//!
//! On a terminal every running build gets a spinner line showing its
//! current phase under an overall `[done/total]` bar; finished builds are
//! printed above the bars. Without a terminal the same events become plain
//! one-line messages on stderr.

use super::worker::BuildSource;
use crate::spec::Spec;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::io::Write;
use std::time::{Duration, Instant};

/// How often spinners advance
pub const REDRAW_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub name: String,
    pub label: String,
    pub state: String,
    pub progress: Option<(u64, u64)>,
    pub started: Instant,
}

pub struct BuildStatus {
    multi: MultiProgress,
    overall: ProgressBar,
    bars: HashMap<String, ProgressBar>,
    builds: HashMap<String, BuildInfo>,
    /// Running builds in start order
    order: Vec<String>,
    echo_target: Option<String>,
    tty: bool,
    finished: usize,
    failed: usize,
    last_redraw: Instant,
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.green} {prefix:.bold} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn overall_style() -> ProgressStyle {
    ProgressStyle::with_template("[{pos}/{len}] [{bar:30.cyan/blue}] {elapsed} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

impl BuildStatus {
    pub fn new(total: usize, tty: bool) -> Self {
        let target = if tty {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        let multi = MultiProgress::with_draw_target(target);
        let overall = multi.add(ProgressBar::new(total as u64));
        overall.set_style(overall_style());

        Self {
            multi,
            overall,
            bars: HashMap::new(),
            builds: HashMap::new(),
            order: Vec::new(),
            echo_target: None,
            tty,
            finished: 0,
            failed: 0,
            last_redraw: Instant::now(),
        }
    }

    fn message(&self, hash: &str) -> String {
        let Some(info) = self.builds.get(hash) else {
            return String::new();
        };
        let mut msg = info.state.clone();
        if let Some((n, m)) = info.progress {
            msg.push_str(&format!(" ({}/{})", n, m));
        }
        if self.echo_target.as_deref() == Some(hash) {
            msg.push_str(" [echo]");
        }
        msg
    }

    fn refresh(&self, hash: &str) {
        if let Some(bar) = self.bars.get(hash) {
            bar.set_message(self.message(hash));
        }
    }

    /// Print a line above the bars (or to stderr without a terminal)
    pub fn println(&self, line: &str) {
        if self.tty {
            let _ = self.multi.println(line);
        } else {
            eprintln!("{}", line);
        }
    }

    pub fn add_build(&mut self, spec: &Spec) {
        let hash = spec.dag_hash().to_string();
        let info = BuildInfo {
            name: spec.name().to_string(),
            label: spec.cformat(),
            state: "starting".to_string(),
            progress: None,
            started: Instant::now(),
        };
        if !self.tty {
            eprintln!("==> Installing {}", info.label);
        }

        let bar = self.multi.insert_before(&self.overall, ProgressBar::new_spinner());
        bar.set_style(spinner_style());
        bar.set_prefix(info.label.clone());
        self.bars.insert(hash.clone(), bar);
        self.builds.insert(hash.clone(), info);
        self.order.push(hash.clone());
        self.refresh(&hash);
    }

    pub fn update_state(&mut self, hash: &str, state: &str) {
        if let Some(info) = self.builds.get_mut(hash) {
            info.state = state.to_string();
        }
        self.refresh(hash);
    }

    pub fn update_progress(&mut self, hash: &str, progress: u64, total: u64) {
        if let Some(info) = self.builds.get_mut(hash) {
            info.progress = Some((progress, total));
        }
        self.refresh(hash);
    }

    pub fn finish(&mut self, hash: &str, source: Option<BuildSource>) {
        let Some(info) = self.builds.remove(hash) else {
            return;
        };
        self.order.retain(|h| h != hash);
        if self.echo_target.as_deref() == Some(hash) {
            self.echo_target = None;
        }
        if let Some(bar) = self.bars.remove(hash) {
            bar.finish_and_clear();
            self.multi.remove(&bar);
        }

        let elapsed = info.started.elapsed().as_secs_f64();
        let line = match source {
            Some(source) => {
                self.finished += 1;
                format!("[+] {} ({}, {:.1}s)", info.label, source, elapsed)
            }
            None => {
                self.failed += 1;
                format!("[x] {} failed during {} ({:.1}s)", info.label, info.state, elapsed)
            }
        };
        self.println(&line);
        self.overall.inc(1);
        if self.failed > 0 {
            self.overall.set_message(format!("{} failed", self.failed));
        }
    }

    /// Running builds, oldest first
    pub fn running(&self) -> &[String] {
        &self.order
    }

    pub fn echo_target(&self) -> Option<&str> {
        self.echo_target.as_deref()
    }

    /// The build after the current echo target, wrapping around
    pub fn next_echo_target(&self) -> Option<String> {
        if self.order.is_empty() {
            return None;
        }
        let next = match &self.echo_target {
            Some(current) => match self.order.iter().position(|h| h == current) {
                Some(i) => (i + 1) % self.order.len(),
                None => 0,
            },
            None => 0,
        };
        Some(self.order[next].clone())
    }

    pub fn set_echo_target(&mut self, hash: Option<String>) {
        let previous = std::mem::replace(&mut self.echo_target, hash);
        if let Some(prev) = previous {
            self.refresh(&prev);
        }
        if let Some(current) = self.echo_target.clone() {
            if let Some(info) = self.builds.get(&current) {
                self.println(&format!("==> Showing output of {}", info.label));
            }
            self.refresh(&current);
        }
    }

    /// Write echoed build output without tearing the bars
    pub fn print_output(&self, bytes: &[u8]) {
        let write = || {
            let mut stderr = std::io::stderr().lock();
            let _ = stderr.write_all(bytes).and_then(|()| stderr.flush());
        };
        if self.tty {
            self.multi.suspend(write);
        } else {
            write();
        }
    }

    /// Advance spinners, at most once per [`REDRAW_INTERVAL`]
    pub fn redraw(&mut self) {
        if self.last_redraw.elapsed() < REDRAW_INTERVAL {
            return;
        }
        self.last_redraw = Instant::now();
        for bar in self.bars.values() {
            bar.tick();
        }
        self.overall.tick();
    }

    pub fn finished(&self) -> usize {
        self.finished
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    /// Remove the dashboard from the terminal
    pub fn clear(&mut self) {
        for (_, bar) in self.bars.drain() {
            bar.finish_and_clear();
        }
        self.overall.finish_and_clear();
        let _ = self.multi.clear();
    }
}
