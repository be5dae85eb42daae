//! Configuration for the fusion and quantization passes.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use sgfuse_ir::{CalibRange, QuantDtype};

/// Which pattern roots take part in fusion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FusionConfig {
    /// Fuse convolution chains (`conv`, `conv+bn`, ..., `conv+bn+sum+relu`).
    pub fuse_conv: bool,
    /// Fuse fully-connected chains (`fc`, `fc+relu`).
    pub fuse_fc: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            fuse_conv: true,
            fuse_fc: true,
        }
    }
}

impl FusionConfig {
    /// A configuration that fuses nothing.
    pub fn disabled() -> Self {
        Self {
            fuse_conv: false,
            fuse_fc: false,
        }
    }
}

/// Requested fixed-point precision for quantized activations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QuantizeTarget {
    Int8,
    Uint8,
    /// `uint8` for non-negative ranges, `int8` otherwise.
    #[default]
    Auto,
}

impl QuantizeTarget {
    /// The concrete dtype used for a tensor calibrated to `range`.
    pub fn dtype_for(self, range: &CalibRange) -> QuantDtype {
        match self {
            Self::Int8 => QuantDtype::Int8,
            Self::Uint8 => QuantDtype::Uint8,
            Self::Auto if range.is_non_negative() => QuantDtype::Uint8,
            Self::Auto => QuantDtype::Int8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::Uint8 => "uint8",
            Self::Auto => "auto",
        }
    }
}

impl FromStr for QuantizeTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "int8" => Ok(Self::Int8),
            "uint8" => Ok(Self::Uint8),
            "auto" => Ok(Self::Auto),
            other => Err(format!(
                "unknown quantized dtype '{other}' (expected uint8, int8 or auto)"
            )),
        }
    }
}

/// How observed values are turned into a calibration range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CalibMode {
    /// Running minimum and maximum.
    #[default]
    Naive,
    /// Histogram threshold minimizing KL divergence; clips outliers.
    Entropy,
}

impl CalibMode {
    /// Parse a mode name (case-insensitive).
    ///
    /// Accepts `naive` / `minmax` and `entropy` / `kl`.
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "naive" | "minmax" => Some(Self::Naive),
            "entropy" | "kl" => Some(Self::Entropy),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Naive => "naive",
            Self::Entropy => "entropy",
        }
    }
}

/// Predicate over tensor names selecting what calibration records.
#[derive(Clone)]
pub struct LayerFilter(Arc<dyn Fn(&str) -> bool + Send + Sync>);

impl LayerFilter {
    pub fn new(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Accept every tensor.
    pub fn all() -> Self {
        Self::new(|_| true)
    }

    /// Accept tensors whose name ends with `suffix`.
    pub fn suffix(suffix: impl Into<String>) -> Self {
        let suffix = suffix.into();
        Self::new(move |name| name.ends_with(&suffix))
    }

    pub fn matches(&self, name: &str) -> bool {
        (self.0)(name)
    }
}

impl Default for LayerFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for LayerFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LayerFilter(..)")
    }
}

/// Settings for calibration and the quantization rewrite.
#[derive(Clone, Debug, Default)]
pub struct QuantizeConfig {
    pub target: QuantizeTarget,
    pub calib_mode: CalibMode,
    /// Upper bound on calibration batches; `None` uses the whole dataset.
    pub num_calib_examples: Option<usize>,
    /// Node names that stay in floating point.
    pub excluded_names: BTreeSet<String>,
    /// Which tensors the collector records.
    pub calib_layer: LayerFilter,
    /// Let a quantized fully-connected feeding only a dequantize emit float
    /// directly (`enable_float_output`).
    pub fc_float_output: bool,
}

impl QuantizeConfig {
    pub fn is_excluded(&self, node: &str) -> bool {
        self.excluded_names.contains(node)
    }
}
