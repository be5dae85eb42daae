//! Scalar and shape descriptors for graph tensors.

/// Width of a scalar type in bytes.
pub type Bytes = u8;

/// The kind of a scalar type.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum ScalarKind {
    /// Signed integer.
    Sint,
    /// Unsigned integer.
    Uint,
    /// Floating point.
    Float,
}

/// A scalar type: kind + byte width.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Scalar {
    pub kind: ScalarKind,
    pub width: Bytes,
}

impl Scalar {
    pub const F32: Self = Self {
        kind: ScalarKind::Float,
        width: 4,
    };
    pub const I32: Self = Self {
        kind: ScalarKind::Sint,
        width: 4,
    };
    pub const I8: Self = Self {
        kind: ScalarKind::Sint,
        width: 1,
    };
    pub const U8: Self = Self {
        kind: ScalarKind::Uint,
        width: 1,
    };

    /// Whether this is a floating-point scalar.
    pub fn is_float(self) -> bool {
        self.kind == ScalarKind::Float
    }
}

/// A tensor dimension that may be fixed or symbolic.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum Dimension {
    /// Known size.
    Fixed(u32),
    /// Unknown at graph construction time, optionally named (e.g. `"batch"`).
    Dynamic(Option<String>),
}

impl Dimension {
    /// Returns the fixed size, if known.
    pub fn fixed(&self) -> Option<usize> {
        match self {
            Self::Fixed(n) => Some(*n as usize),
            Self::Dynamic(_) => None,
        }
    }
}

/// Shape of a tensor, outermost dimension first.
#[derive(Clone, Debug, Default, Hash, Eq, PartialEq)]
pub struct TensorShape {
    pub dims: Vec<Dimension>,
}

impl TensorShape {
    /// Builds a fully static shape.
    pub fn fixed(dims: &[usize]) -> Self {
        Self {
            dims: dims.iter().map(|&d| Dimension::Fixed(d as u32)).collect(),
        }
    }

    /// Builds a shape of the given rank whose every dimension is unknown.
    pub fn dynamic(rank: usize) -> Self {
        Self {
            dims: vec![Dimension::Dynamic(None); rank],
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Returns the concrete dimensions when every dimension is fixed.
    pub fn to_fixed(&self) -> Option<Vec<usize>> {
        self.dims.iter().map(Dimension::fixed).collect()
    }

    /// Size of dimension `axis`, if it exists and is fixed.
    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims.get(axis).and_then(Dimension::fixed)
    }
}
