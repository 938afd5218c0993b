use std::{fmt, time::Instant};

const COLUMNS: [&str; 10] = [
    "avg. loss",
    "der. mag.",
    "d. m. cond.",
    "wolfe1",
    "wolfe2",
    "mix fraction",
    "curvature",
    "dir. magnitude",
    "step size",
    "time",
];

/// One row of the per-pass table. Empty columns print as blanks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassLine {
    pub pass: usize,
    pub avg_loss: Option<f64>,
    pub der_mag: Option<f64>,
    pub dm_cond: Option<f64>,
    pub wolfe1: Option<f64>,
    pub wolfe2: Option<f64>,
    pub mix: Option<f64>,
    pub curvature: Option<f64>,
    pub dir_mag: Option<f64>,
    pub step: Option<f64>,
    /// Back-step ratio `new_step / step`; replaces the curvature columns.
    pub revise: Option<f64>,
}

impl PassLine {
    pub fn new(pass: usize) -> Self {
        Self {
            pass,
            ..Default::default()
        }
    }
}

fn column(f: &mut fmt::Formatter<'_>, value: Option<f64>) -> fmt::Result {
    match value {
        Some(v) if v.abs() >= 1e5 || (v != 0.0 && v.abs() < 1e-4) => write!(f, "{:<10.4e}\t", v),
        Some(v) => write!(f, "{:<10.5}\t", v),
        None => write!(f, "{:<10}\t", ""),
    }
}

impl fmt::Display for PassLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<2} ", self.pass)?;
        for v in [
            self.avg_loss,
            self.der_mag,
            self.dm_cond,
            self.wolfe1,
            self.wolfe2,
        ] {
            column(f, v)?;
        }
        if let Some(ratio) = self.revise {
            write!(f, "(revise x {:.1})\t", ratio)?;
            return column(f, self.step);
        }
        for v in [self.mix, self.curvature, self.dir_mag, self.step] {
            column(f, v)?;
        }
        Ok(())
    }
}

/// Prints the per-pass table to stderr unless `quiet`.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    quiet: bool,
    start: Instant,
}

impl Diagnostics {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn header(&self) {
        if self.quiet {
            return;
        }
        let cols: Vec<String> = COLUMNS.iter().map(|c| format!("{:<10}", c)).collect();
        eprintln!("## {}", cols.join("\t"));
    }

    pub fn emit(&self, line: &PassLine) {
        if self.quiet {
            return;
        }
        eprintln!("{}{:.3}", line, self.elapsed());
    }
}
