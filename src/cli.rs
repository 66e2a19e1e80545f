use clap::Parser;
use std::path::PathBuf;

use crate::config::TransferConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Segmented, resumable HTTP(S) file downloader", long_about = None)]
pub struct Args {
    /// URL of the file to download
    #[arg(index = 1, required_unless_present = "list")]
    pub url: Option<String>,

    /// Directory to save downloaded files
    #[arg(short = 'd', long = "download-dir", default_value = "downloads")]
    pub download_dir: PathBuf,

    /// Number of segments downloaded in parallel
    #[arg(short = 's', long = "segments")]
    pub segments: Option<usize>,

    /// TOML file with transfer settings
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Replace the destination file if it already exists
    #[arg(long)]
    pub force: bool,

    /// List unfinished downloads in the download directory
    #[arg(short = 'l', long)]
    pub list: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }

    /// Command line values take precedence over the config file.
    pub fn apply_to(&self, config: &mut TransferConfig) {
        if let Some(segments) = self.segments {
            config.segment_count = segments;
        }
        if self.force {
            config.force = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_override_config() {
        let args = Args::parse_from(["segfetch", "https://example.com/a.bin", "-s", "8", "--force", "-vv"]);
        let mut config = TransferConfig::default();
        args.apply_to(&mut config);

        assert_eq!(config.segment_count, 8);
        assert!(config.force);
        assert_eq!(args.log_filter(), "debug");
        assert_eq!(args.download_dir, PathBuf::from("downloads"));
    }

    #[test]
    fn test_url_required_unless_listing() {
        assert!(Args::try_parse_from(["segfetch"]).is_err());
        let args = Args::try_parse_from(["segfetch", "--list", "-d", "/tmp/dl"]).unwrap();
        assert!(args.list);
        assert!(args.url.is_none());
    }
}
