use crate::DataType;

/// Marker for a dimension whose extent is not known yet.
pub const DIM_UNKNOWN: i64 = -1;

/// Memory layout of a logical tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Layout {
    /// Left for the backend to decide.
    #[default]
    Any,
    /// Explicit per-dimension strides, in elements.
    Strided(Vec<i64>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Property {
    #[default]
    Undef,
    Constant,
}

/// Shape, type and layout descriptor attached to a graph edge.
///
/// `id` is global: it correlates the same edge across graph copies and with the caller's
/// boundary tensors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct LogicalTensor {
    pub id: usize,
    /// `None` when even the rank is unknown.
    pub dims: Option<Vec<i64>>,
    pub data_type: DataType,
    pub layout: Layout,
    pub property: Property,
}

/// Compute default (contiguous) strides for a tensor of given shape.
pub fn dense_strides(dims: &[i64]) -> Vec<i64> {
    let mut strides = Vec::with_capacity(dims.len());
    let mut acc = 1;
    // Iterate dims in reverse to accumulate products
    for dim in dims.iter().rev() {
        strides.push(acc);
        acc *= (*dim).max(1);
    }
    strides.reverse();
    strides
}

impl LogicalTensor {
    /// A fully specified tensor with a dense row-major layout.
    pub fn new(id: usize, dims: impl Into<Vec<i64>>, data_type: DataType) -> Self {
        let dims = dims.into();
        let strides = dense_strides(&dims);
        Self {
            id,
            dims: Some(dims),
            data_type,
            layout: Layout::Strided(strides),
            property: Property::Undef,
        }
    }

    /// A tensor whose rank and shape are left to shape inference.
    pub fn unknown(id: usize, data_type: DataType) -> Self {
        Self {
            id,
            dims: None,
            data_type,
            layout: Layout::Any,
            property: Property::Undef,
        }
    }

    #[must_use]
    pub fn with_strides(mut self, strides: impl Into<Vec<i64>>) -> Self {
        self.layout = Layout::Strided(strides.into());
        self
    }

    #[must_use]
    pub fn with_any_layout(mut self) -> Self {
        self.layout = Layout::Any;
        self
    }

    #[must_use]
    pub fn constant(mut self) -> Self {
        self.property = Property::Constant;
        self
    }

    pub fn ndims(&self) -> Option<usize> {
        self.dims.as_ref().map(Vec::len)
    }

    /// Dims as a slice; empty when the rank is unknown.
    pub fn vdims(&self) -> &[i64] {
        self.dims.as_deref().unwrap_or(&[])
    }

    pub fn is_shape_known(&self) -> bool {
        self.dims
            .as_ref()
            .is_some_and(|dims| dims.iter().all(|d| *d >= 0))
    }

    pub fn element_count(&self) -> usize {
        self.vdims().iter().map(|d| (*d).max(0) as usize).product()
    }

    pub fn strides(&self) -> Option<&[i64]> {
        match &self.layout {
            Layout::Strided(strides) => Some(strides),
            Layout::Any => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        self.property == Property::Constant
    }

    /// Replace an unresolved or rank-mismatched layout with dense row-major strides.
    pub(crate) fn force_dense_layout(&mut self) {
        let Some(dims) = &self.dims else {
            return;
        };
        let keep = matches!(&self.layout, Layout::Strided(s) if s.len() == dims.len());
        if !keep {
            self.layout = Layout::Strided(dense_strides(dims));
        }
    }
}
