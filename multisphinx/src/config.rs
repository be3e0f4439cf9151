use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur while loading or resolving a [`Config`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("config file not found: {0}")]
    FileNotFound(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("required argument missing: {0}")]
    MissingArgument(String),

    #[error("unknown option value for {0}: {1}")]
    UnknownOption(String, String),
}

/// Resolved search configuration (search.md §6).
///
/// Beam widths are stored in the same log domain the search uses
/// internally (see [`crate::logmath`]); `Config::new` does not convert
/// units, callers are expected to pass already-converted values, the
/// same way the original command line took `-beam` et al. directly as
/// logmath-base values.
#[derive(Debug, Clone)]
pub struct Config {
    // Pruning beams (additive, in log domain; smaller magnitude = wider).
    pub beam: f64,
    pub wbeam: f64,
    pub pbeam: f64,
    pub lpbeam: f64,
    pub lponlybeam: f64,
    pub fwdflatbeam: f64,
    pub fwdflatwbeam: f64,

    // Per-frame caps.
    pub maxwpf: usize,
    pub maxhmmpf: usize,
    pub maxsilfr: usize,

    // Penalties (log domain).
    pub wip: f64,
    pub nwpen: f64,
    pub pip: f64,
    pub silprob: f64,
    pub fillprob: f64,

    // Flat-lexicon pass parameters.
    pub fwdflatsfwin: usize,
    pub fwdflatefwid: usize,
    pub fwdflatlw: f64,
    pub lw: f64,

    // Bptbl/lattice sizing.
    pub latsize: usize,

    // External resource paths (opaque to this crate; forwarded to the
    // acoustic model / dictionary / language model contracts).
    pub vm: Option<PathBuf>,
    pub lm: Option<PathBuf>,
    pub lmctl: Option<PathBuf>,
    pub lmname: Option<String>,
    pub fwdtreelm: Option<PathBuf>,
    pub arcdumpdir: Option<PathBuf>,
    pub hmm: Option<PathBuf>,
    pub dict: Option<PathBuf>,
    pub mdef: Option<PathBuf>,
    pub mean: Option<PathBuf>,
    pub var: Option<PathBuf>,
    pub tmat: Option<PathBuf>,
    pub mixw: Option<PathBuf>,
    pub sendump: Option<PathBuf>,
    pub fdict: Option<PathBuf>,
    pub lda: Option<PathBuf>,
    pub featparams: Option<PathBuf>,
    pub senmgau: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            beam: -64.0,
            wbeam: -40.0,
            pbeam: -40.0,
            lpbeam: -40.0,
            lponlybeam: -20.0,
            fwdflatbeam: -64.0,
            fwdflatwbeam: -40.0,
            maxwpf: 20,
            maxhmmpf: 30_000,
            maxsilfr: 96,
            wip: 0.65,
            nwpen: 1.0,
            pip: 1.0,
            silprob: 0.005,
            fillprob: 1e-8,
            fwdflatsfwin: 25,
            fwdflatefwid: 4,
            fwdflatlw: 8.5,
            lw: 6.5,
            latsize: 5_000,
            vm: None,
            lm: None,
            lmctl: None,
            lmname: None,
            fwdtreelm: None,
            arcdumpdir: None,
            hmm: None,
            dict: None,
            mdef: None,
            mean: None,
            var: None,
            tmat: None,
            mixw: None,
            sendump: None,
            fdict: None,
            lda: None,
            featparams: None,
            senmgau: None,
        }
    }
}

/// Raw on-disk representation. Field names here are the JSON object
/// keys: everything is optional so that a config file only needs to
/// override what it cares about, the rest comes from [`Config::default`].
#[derive(Deserialize, Debug, Default)]
struct RawConfig {
    beam: Option<f64>,
    wbeam: Option<f64>,
    pbeam: Option<f64>,
    lpbeam: Option<f64>,
    lponlybeam: Option<f64>,
    fwdflatbeam: Option<f64>,
    fwdflatwbeam: Option<f64>,

    maxwpf: Option<usize>,
    maxhmmpf: Option<usize>,
    maxsilfr: Option<usize>,

    wip: Option<f64>,
    nwpen: Option<f64>,
    pip: Option<f64>,
    silprob: Option<f64>,
    fillprob: Option<f64>,

    fwdflatsfwin: Option<usize>,
    fwdflatefwid: Option<usize>,
    fwdflatlw: Option<f64>,
    lw: Option<f64>,

    latsize: Option<usize>,

    vm: Option<PathBuf>,
    lm: Option<PathBuf>,
    lmctl: Option<PathBuf>,
    lmname: Option<String>,
    fwdtreelm: Option<PathBuf>,
    arcdumpdir: Option<PathBuf>,
    hmm: Option<PathBuf>,
    dict: Option<PathBuf>,
    mdef: Option<PathBuf>,
    mean: Option<PathBuf>,
    var: Option<PathBuf>,
    tmat: Option<PathBuf>,
    mixw: Option<PathBuf>,
    sendump: Option<PathBuf>,
    fdict: Option<PathBuf>,
    lda: Option<PathBuf>,
    featparams: Option<PathBuf>,
    senmgau: Option<PathBuf>,
}

macro_rules! apply_override {
    ($base:expr, $raw:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(v) = $raw.$field {
                $base.$field = v;
            }
        )+
    };
}

impl Config {
    /// Load a configuration file and resolve it against the defaults.
    ///
    /// Precedence is file-over-default for every field; there is no
    /// separate CLI-override layer here (the CLI binary applies its own
    /// overrides on top of the returned `Config` by direct field
    /// assignment, the same way `sudachi-cli` turns `structopt` fields
    /// into `Config` overrides after loading the file).
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let raw: RawConfig = serde_json::from_reader(reader)?;
        Ok(Self::from_raw(raw))
    }

    /// Resolve a configuration from JSON text (used by tests and by
    /// embedders that already have the file contents in memory).
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(text)?;
        Ok(Self::from_raw(raw))
    }

    fn from_raw(raw: RawConfig) -> Self {
        let mut cfg = Config::default();
        apply_override!(
            cfg, raw, beam, wbeam, pbeam, lpbeam, lponlybeam, fwdflatbeam, fwdflatwbeam, maxwpf,
            maxhmmpf, maxsilfr, wip, nwpen, pip, silprob, fillprob, fwdflatsfwin, fwdflatefwid,
            fwdflatlw, lw, latsize, vm, lm, lmctl, lmname, fwdtreelm, arcdumpdir, hmm, dict, mdef,
            mean, var, tmat, mixw, sendump, fdict, lda, featparams, senmgau,
        );
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_is_empty_object() {
        let cfg = Config::from_json("{}").unwrap();
        assert_eq!(cfg.maxwpf, Config::default().maxwpf);
        assert_eq!(cfg.beam, Config::default().beam);
    }

    #[test]
    fn overrides_only_named_fields() {
        let cfg = Config::from_json(r#"{"maxwpf": 7, "beam": -32.0}"#).unwrap();
        assert_eq!(cfg.maxwpf, 7);
        assert_eq!(cfg.beam, -32.0);
        assert_eq!(cfg.wbeam, Config::default().wbeam);
    }

    #[test]
    fn missing_file_is_reported() {
        let err = Config::from_file(&PathBuf::from("/nonexistent/multisphinx.json")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }
}
