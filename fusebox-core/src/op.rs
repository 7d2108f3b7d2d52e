use std::collections::BTreeMap;
use std::fmt::{self, Display};

use crate::graph::ValueId;
use crate::{Error, Result};

/// The closed set of operator kinds a partition may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Add,
    Subtract,
    Multiply,
    Divide,
    MatMul,
    Quantize,
    Dequantize,
    StaticReshape,
    StaticTranspose,
    SoftMax,
    Reorder,
    TypeCast,
    Relu,
    Sigmoid,
    Gelu,
    ReluBackprop,
    SigmoidBackprop,
    GeluBackprop,
    ReduceSum,
    BiasAdd,
    Convolution,
    ConvTranspose,
    MaxPool,
    AvgPool,
    BatchNormFolding,
    MulScales,
}

impl OpKind {
    pub const ALL: [OpKind; 26] = [
        Self::Add,
        Self::Subtract,
        Self::Multiply,
        Self::Divide,
        Self::MatMul,
        Self::Quantize,
        Self::Dequantize,
        Self::StaticReshape,
        Self::StaticTranspose,
        Self::SoftMax,
        Self::Reorder,
        Self::TypeCast,
        Self::Relu,
        Self::Sigmoid,
        Self::Gelu,
        Self::ReluBackprop,
        Self::SigmoidBackprop,
        Self::GeluBackprop,
        Self::ReduceSum,
        Self::BiasAdd,
        Self::Convolution,
        Self::ConvTranspose,
        Self::MaxPool,
        Self::AvgPool,
        Self::BatchNormFolding,
        Self::MulScales,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Add => "Add",
            Self::Subtract => "Subtract",
            Self::Multiply => "Multiply",
            Self::Divide => "Divide",
            Self::MatMul => "MatMul",
            Self::Quantize => "Quantize",
            Self::Dequantize => "Dequantize",
            Self::StaticReshape => "StaticReshape",
            Self::StaticTranspose => "StaticTranspose",
            Self::SoftMax => "SoftMax",
            Self::Reorder => "Reorder",
            Self::TypeCast => "TypeCast",
            Self::Relu => "ReLU",
            Self::Sigmoid => "Sigmoid",
            Self::Gelu => "GELU",
            Self::ReluBackprop => "ReLUBackprop",
            Self::SigmoidBackprop => "SigmoidBackprop",
            Self::GeluBackprop => "GELUBackprop",
            Self::ReduceSum => "ReduceSum",
            Self::BiasAdd => "BiasAdd",
            Self::Convolution => "Convolution",
            Self::ConvTranspose => "ConvTranspose",
            Self::MaxPool => "MaxPool",
            Self::AvgPool => "AvgPool",
            Self::BatchNormFolding => "BatchNormFolding",
            Self::MulScales => "MulScales",
        }
    }

    /// Number of user-visible outputs. Kinds with a scratchpad may carry one more.
    pub const fn num_real_outputs(&self) -> usize {
        match self {
            Self::BatchNormFolding => 2,
            _ => 1,
        }
    }

    /// Kinds that may append a backend-private workspace output.
    pub const fn has_scratchpad(&self) -> bool {
        matches!(
            self,
            Self::Convolution
                | Self::ConvTranspose
                | Self::MaxPool
                | Self::AvgPool
                | Self::MatMul
                | Self::BatchNormFolding
                | Self::Reorder
                | Self::MulScales
        )
    }
}

impl Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Attribute names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpAttr {
    Axis,
    Axes,
    Qtype,
    Scales,
    Zps,
    Shape,
    SpecialZero,
    Order,
    KeepDims,
    DataFormat,
    WeightsFormat,
    TransposeA,
    TransposeB,
    Strides,
    PadsBegin,
    PadsEnd,
    Dilations,
    Groups,
    Kernel,
    AutoPad,
    RoundingType,
    ExcludePad,
    OutputPadding,
    Epsilon,
}

impl OpAttr {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Axis => "axis",
            Self::Axes => "axes",
            Self::Qtype => "qtype",
            Self::Scales => "scales",
            Self::Zps => "zps",
            Self::Shape => "shape",
            Self::SpecialZero => "special_zero",
            Self::Order => "order",
            Self::KeepDims => "keep_dims",
            Self::DataFormat => "data_format",
            Self::WeightsFormat => "weights_format",
            Self::TransposeA => "transpose_a",
            Self::TransposeB => "transpose_b",
            Self::Strides => "strides",
            Self::PadsBegin => "pads_begin",
            Self::PadsEnd => "pads_end",
            Self::Dilations => "dilations",
            Self::Groups => "groups",
            Self::Kernel => "kernel",
            Self::AutoPad => "auto_pad",
            Self::RoundingType => "rounding_type",
            Self::ExcludePad => "exclude_pad",
            Self::OutputPadding => "output_padding",
            Self::Epsilon => "epsilon",
        }
    }
}

/// An attribute value: one of six kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Ints(Vec<i64>),
    Float(f32),
    Floats(Vec<f32>),
    Str(String),
    Bool(bool),
}

impl AttrValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            Self::Ints(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_floats(&self) -> Option<&[f32]> {
        match self {
            Self::Floats(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(v: Vec<i64>) -> Self {
        Self::Ints(v)
    }
}

impl From<f32> for AttrValue {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<Vec<f32>> for AttrValue {
    fn from(v: Vec<f32>) -> Self {
        Self::Floats(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

pub type Attributes = BTreeMap<OpAttr, AttrValue>;

/// A node of an [`OpGraph`](crate::OpGraph).
///
/// Identity is `id`; inputs and outputs index the owning graph's value arena.
#[derive(Debug, Clone, PartialEq)]
pub struct Op {
    pub(crate) id: usize,
    pub(crate) kind: OpKind,
    pub(crate) attrs: Attributes,
    pub(crate) inputs: Vec<ValueId>,
    pub(crate) outputs: Vec<ValueId>,
    pub(crate) is_constant: bool,
}

macro_rules! attr_getter {
    ($name:ident, $require:ident, $conv:ident, $ty:ty) => {
        pub fn $name(&self, attr: OpAttr) -> Result<Option<$ty>> {
            match self.attrs.get(&attr) {
                None => Ok(None),
                Some(v) => v
                    .$conv()
                    .map(Some)
                    .ok_or(Error::UnsupportedAttr { op: self.id, attr }),
            }
        }

        pub fn $require(&self, attr: OpAttr) -> Result<$ty> {
            self.$name(attr)?
                .ok_or(Error::MissingAttr { op: self.id, attr })
        }
    };
}

impl Op {
    /// A detached op, not yet part of any graph.
    pub fn new(kind: OpKind) -> Self {
        Self {
            id: 0,
            kind,
            attrs: Attributes::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            is_constant: false,
        }
    }

    /// Scratch copy used by shape inference: same kind and attributes, no edges.
    pub(crate) fn scratch(&self) -> Self {
        let mut op = Self::new(self.kind);
        op.id = self.id;
        op.attrs.extend(self.attrs.clone());
        op
    }

    #[must_use]
    pub fn with_attr(mut self, attr: OpAttr, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(attr, value.into());
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn attrs(&self) -> &Attributes {
        &self.attrs
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    pub fn is_constant(&self) -> bool {
        self.is_constant
    }

    pub fn has_attr(&self, attr: OpAttr) -> bool {
        self.attrs.contains_key(&attr)
    }

    attr_getter!(int, require_int, as_int, i64);
    attr_getter!(ints, require_ints, as_ints, &[i64]);
    attr_getter!(float, require_float, as_float, f32);
    attr_getter!(floats, require_floats, as_floats, &[f32]);
    attr_getter!(string, require_string, as_str, &str);
    attr_getter!(boolean, require_boolean, as_bool, bool);
}
