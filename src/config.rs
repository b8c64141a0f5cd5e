use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;

/// Sleep scoring selection, e.g. "sadeh", "sadeh:capped",
/// "cole-kripke:max-activity", "sustained-inactivity".
#[derive(Debug, Clone)]
pub struct SleepAlgorithmChoice {
    pub algorithm: String,
    pub variant: Option<String>,
}

impl SleepAlgorithmChoice {
    pub fn is_epoch_family(&self) -> bool {
        matches!(self.algorithm.as_str(), "sadeh" | "cole-kripke")
    }
}

impl FromStr for SleepAlgorithmChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, variant) = match s.split_once(':') {
            Some((a, v)) => (a.to_string(), Some(v.to_string())),
            None => (s.to_string(), None),
        };
        match algorithm.as_str() {
            "sadeh" | "cole-kripke" | "sustained-inactivity" => Ok(Self { algorithm, variant }),
            _ => Err(format!(
                "Invalid sleep algorithm: {}. Use sadeh[:original|:capped], cole-kripke[:mean-activity|:max-activity], or sustained-inactivity",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonwearChoice {
    StddevRange,
    CountThreshold,
    Capacitive,
}

impl FromStr for NonwearChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stddev-range" => Ok(NonwearChoice::StddevRange),
            "count-threshold" => Ok(NonwearChoice::CountThreshold),
            "capacitive" => Ok(NonwearChoice::Capacitive),
            _ => Err(format!(
                "Invalid nonwear algorithm: {}. Use stddev-range (default), count-threshold, or capacitive",
                s
            )),
        }
    }
}

/// Process accelerometer container files into activity and sleep metrics
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to a .acc container file or a directory to scan
    #[arg(help = "Path to a .acc container file or a directory to scan")]
    pub input_path: PathBuf,

    /// Print container metadata only, without decoding samples
    #[arg(long)]
    pub metadata_only: bool,

    /// Decode auxiliary light/battery/wear channels when present
    #[arg(long)]
    pub include_aux: bool,

    /// Skip sphere-fit autocalibration
    #[arg(long)]
    pub no_calibration: bool,

    /// Skip gap imputation
    #[arg(long)]
    pub no_imputation: bool,

    /// Epoch length in seconds for count aggregation
    #[arg(long, default_value = "60.0")]
    pub epoch_length: f64,

    /// Backend id to use (default: auto-select by priority)
    #[arg(long)]
    pub backend: Option<String>,

    /// List registered backends and exit
    #[arg(long)]
    pub list_backends: bool,

    /// Sleep scoring algorithm, optionally with a variant after a colon
    #[arg(long, default_value = "sadeh")]
    pub sleep_algorithm: SleepAlgorithmChoice,

    /// Nonwear detection algorithm
    #[arg(long, default_value = "stddev-range")]
    pub nonwear_algorithm: NonwearChoice,

    /// Named threshold preset for the stddev-range nonwear detector
    #[arg(long, default_value = "default")]
    pub nonwear_preset: String,

    /// CSV output file prefix (e.g. /path/to/output/prefix)
    #[arg(long)]
    pub csv_output: Option<String>,

    /// Window length in hours for most/least-active statistics
    #[arg(long, default_value = "5.0")]
    pub active_window_hours: f64,

    /// Timestamp slack in milliseconds before a jump counts as a gap
    #[arg(long, default_value = "1000.0")]
    pub gap_tolerance_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_algorithm_with_variant() {
        let choice: SleepAlgorithmChoice = "cole-kripke:max-activity".parse().unwrap();
        assert_eq!(choice.algorithm, "cole-kripke");
        assert_eq!(choice.variant.as_deref(), Some("max-activity"));
        assert!(choice.is_epoch_family());

        let bare: SleepAlgorithmChoice = "sustained-inactivity".parse().unwrap();
        assert!(bare.variant.is_none());
        assert!(!bare.is_epoch_family());

        assert!("polysomnography".parse::<SleepAlgorithmChoice>().is_err());
    }

    #[test]
    fn parses_nonwear_choice() {
        assert_eq!(
            "count-threshold".parse::<NonwearChoice>().unwrap(),
            NonwearChoice::CountThreshold
        );
        assert!("telepathy".parse::<NonwearChoice>().is_err());
    }
}
