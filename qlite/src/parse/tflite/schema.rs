//! TFLite flatbuffer schema (version 3), reader side.
//!
//! Field slots follow `schema.fbs`; vtable offsets are `4 + 2 * field_index`.
//! Only the tables and option types the converter emits are modelled.

#![allow(clippy::missing_safety_doc)]

use flatbuffers::{ForwardsUOffset, Follow, Table, Vector, VOffsetT, Verifiable, Verifier, InvalidFlatbuffer};

pub const FILE_IDENTIFIER: &str = "TFL3";
pub const SCHEMA_VERSION: u32 = 3;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

macro_rules! schema_enum {
    ($(#[$meta:meta])* $name:ident($repr:ty) { $($variant:ident = $value:expr),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(pub $repr);

        #[allow(non_upper_case_globals)]
        impl $name {
            $(pub const $variant: Self = Self($value);)*

            pub fn variant_name(self) -> Option<&'static str> {
                match self {
                    $(Self::$variant => Some(stringify!($variant)),)*
                    _ => None,
                }
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self.variant_name() {
                    Some(name) => f.write_str(name),
                    None => write!(f, "<{} {}>", stringify!($name), self.0),
                }
            }
        }
    };
}

schema_enum!(
    /// Builtin operator codes used by the converter.
    BuiltinOperator(i32) {
        ADD = 0,
        AVERAGE_POOL_2D = 1,
        CONCATENATION = 2,
        CONV_2D = 3,
        DEPTHWISE_CONV_2D = 4,
        DEQUANTIZE = 6,
        FULLY_CONNECTED = 9,
        LOGISTIC = 14,
        MAX_POOL_2D = 17,
        MUL = 18,
        RELU = 19,
        RELU_N1_TO_1 = 20,
        RELU6 = 21,
        RESHAPE = 22,
        SOFTMAX = 25,
        TANH = 28,
        PAD = 34,
        TRANSPOSE = 39,
        MEAN = 40,
        SUB = 41,
        DIV = 42,
        MAXIMUM = 55,
        MINIMUM = 57,
        QUANTIZE = 114,
        HARD_SWISH = 117,
    }
);

/// `deprecated_builtin_code` value meaning "read `builtin_code` instead".
pub const PLACEHOLDER_FOR_GREATER_OP_CODES: i8 = 127;

schema_enum!(
    TensorType(i8) {
        FLOAT32 = 0,
        INT32 = 2,
        UINT8 = 3,
        INT64 = 4,
        INT8 = 9,
    }
);

schema_enum!(
    Padding(i8) {
        SAME = 0,
        VALID = 1,
    }
);

schema_enum!(
    ActivationFunctionType(i8) {
        NONE = 0,
        RELU = 1,
        RELU_N1_TO_1 = 2,
        RELU6 = 3,
        TANH = 4,
    }
);

schema_enum!(
    /// Discriminant of the `BuiltinOptions` union.
    BuiltinOptions(u8) {
        NONE = 0,
        Conv2DOptions = 1,
        DepthwiseConv2DOptions = 2,
        Pool2DOptions = 5,
        FullyConnectedOptions = 8,
        SoftmaxOptions = 9,
        ConcatenationOptions = 10,
        AddOptions = 11,
        ReshapeOptions = 17,
        MulOptions = 21,
        PadOptions = 22,
        TransposeOptions = 26,
        ReducerOptions = 27,
        SubOptions = 28,
        DivOptions = 29,
        DequantizeOptions = 38,
        MaximumMinimumOptions = 39,
        QuantizeOptions = 89,
        HardSwishOptions = 91,
    }
);

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

macro_rules! schema_table {
    ($name:ident) => {
        #[derive(Copy, Clone, PartialEq)]
        pub struct $name<'a> {
            pub _tab: Table<'a>,
        }

        impl<'a> Follow<'a> for $name<'a> {
            type Inner = $name<'a>;
            #[inline]
            unsafe fn follow(buf: &'a [u8], loc: usize) -> Self::Inner {
                Self {
                    _tab: Table::new(buf, loc),
                }
            }
        }

        impl<'a> $name<'a> {
            #[inline]
            pub unsafe fn init_from_table(table: Table<'a>) -> Self {
                $name { _tab: table }
            }
        }
    };
}

type Offsets<'a, T> = Vector<'a, ForwardsUOffset<T>>;

schema_table!(Model);

impl<'a> Model<'a> {
    pub const VT_VERSION: VOffsetT = 4;
    pub const VT_OPERATOR_CODES: VOffsetT = 6;
    pub const VT_SUBGRAPHS: VOffsetT = 8;
    pub const VT_DESCRIPTION: VOffsetT = 10;
    pub const VT_BUFFERS: VOffsetT = 12;

    pub fn version(&self) -> u32 {
        unsafe { self._tab.get::<u32>(Self::VT_VERSION, Some(0)).unwrap_or(0) }
    }

    pub fn operator_codes(&self) -> Option<Offsets<'a, OperatorCode<'a>>> {
        unsafe { self._tab.get::<ForwardsUOffset<Offsets<'a, OperatorCode<'a>>>>(Self::VT_OPERATOR_CODES, None) }
    }

    pub fn subgraphs(&self) -> Option<Offsets<'a, SubGraph<'a>>> {
        unsafe { self._tab.get::<ForwardsUOffset<Offsets<'a, SubGraph<'a>>>>(Self::VT_SUBGRAPHS, None) }
    }

    pub fn description(&self) -> Option<&'a str> {
        unsafe { self._tab.get::<ForwardsUOffset<&str>>(Self::VT_DESCRIPTION, None) }
    }

    pub fn buffers(&self) -> Option<Offsets<'a, Buffer<'a>>> {
        unsafe { self._tab.get::<ForwardsUOffset<Offsets<'a, Buffer<'a>>>>(Self::VT_BUFFERS, None) }
    }
}

impl Verifiable for Model<'_> {
    #[inline]
    fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<u32>("version", Self::VT_VERSION, false)?
            .visit_field::<ForwardsUOffset<Offsets<'_, OperatorCode>>>("operator_codes", Self::VT_OPERATOR_CODES, false)?
            .visit_field::<ForwardsUOffset<Offsets<'_, SubGraph>>>("subgraphs", Self::VT_SUBGRAPHS, false)?
            .visit_field::<ForwardsUOffset<&str>>("description", Self::VT_DESCRIPTION, false)?
            .visit_field::<ForwardsUOffset<Offsets<'_, Buffer>>>("buffers", Self::VT_BUFFERS, false)?
            .finish();
        Ok(())
    }
}

schema_table!(OperatorCode);

impl<'a> OperatorCode<'a> {
    pub const VT_DEPRECATED_BUILTIN_CODE: VOffsetT = 4;
    pub const VT_CUSTOM_CODE: VOffsetT = 6;
    pub const VT_VERSION: VOffsetT = 8;
    pub const VT_BUILTIN_CODE: VOffsetT = 10;

    pub fn deprecated_builtin_code(&self) -> i8 {
        unsafe { self._tab.get::<i8>(Self::VT_DEPRECATED_BUILTIN_CODE, Some(0)).unwrap_or(0) }
    }

    pub fn custom_code(&self) -> Option<&'a str> {
        unsafe { self._tab.get::<ForwardsUOffset<&str>>(Self::VT_CUSTOM_CODE, None) }
    }

    pub fn version(&self) -> i32 {
        unsafe { self._tab.get::<i32>(Self::VT_VERSION, Some(1)).unwrap_or(1) }
    }

    pub fn builtin_code(&self) -> BuiltinOperator {
        let code = unsafe { self._tab.get::<i32>(Self::VT_BUILTIN_CODE, Some(0)).unwrap_or(0) };
        // Older writers only fill the deprecated byte.
        BuiltinOperator(code.max(self.deprecated_builtin_code() as i32))
    }
}

impl Verifiable for OperatorCode<'_> {
    #[inline]
    fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<i8>("deprecated_builtin_code", Self::VT_DEPRECATED_BUILTIN_CODE, false)?
            .visit_field::<ForwardsUOffset<&str>>("custom_code", Self::VT_CUSTOM_CODE, false)?
            .visit_field::<i32>("version", Self::VT_VERSION, false)?
            .visit_field::<i32>("builtin_code", Self::VT_BUILTIN_CODE, false)?
            .finish();
        Ok(())
    }
}

schema_table!(SubGraph);

impl<'a> SubGraph<'a> {
    pub const VT_TENSORS: VOffsetT = 4;
    pub const VT_INPUTS: VOffsetT = 6;
    pub const VT_OUTPUTS: VOffsetT = 8;
    pub const VT_OPERATORS: VOffsetT = 10;
    pub const VT_NAME: VOffsetT = 12;

    pub fn tensors(&self) -> Option<Offsets<'a, Tensor<'a>>> {
        unsafe { self._tab.get::<ForwardsUOffset<Offsets<'a, Tensor<'a>>>>(Self::VT_TENSORS, None) }
    }

    pub fn inputs(&self) -> Option<Vector<'a, i32>> {
        unsafe { self._tab.get::<ForwardsUOffset<Vector<'a, i32>>>(Self::VT_INPUTS, None) }
    }

    pub fn outputs(&self) -> Option<Vector<'a, i32>> {
        unsafe { self._tab.get::<ForwardsUOffset<Vector<'a, i32>>>(Self::VT_OUTPUTS, None) }
    }

    pub fn operators(&self) -> Option<Offsets<'a, Operator<'a>>> {
        unsafe { self._tab.get::<ForwardsUOffset<Offsets<'a, Operator<'a>>>>(Self::VT_OPERATORS, None) }
    }

    pub fn name(&self) -> Option<&'a str> {
        unsafe { self._tab.get::<ForwardsUOffset<&str>>(Self::VT_NAME, None) }
    }
}

impl Verifiable for SubGraph<'_> {
    #[inline]
    fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<ForwardsUOffset<Offsets<'_, Tensor>>>("tensors", Self::VT_TENSORS, false)?
            .visit_field::<ForwardsUOffset<Vector<'_, i32>>>("inputs", Self::VT_INPUTS, false)?
            .visit_field::<ForwardsUOffset<Vector<'_, i32>>>("outputs", Self::VT_OUTPUTS, false)?
            .visit_field::<ForwardsUOffset<Offsets<'_, Operator>>>("operators", Self::VT_OPERATORS, false)?
            .visit_field::<ForwardsUOffset<&str>>("name", Self::VT_NAME, false)?
            .finish();
        Ok(())
    }
}

schema_table!(Tensor);

impl<'a> Tensor<'a> {
    pub const VT_SHAPE: VOffsetT = 4;
    pub const VT_TYPE_: VOffsetT = 6;
    pub const VT_BUFFER: VOffsetT = 8;
    pub const VT_NAME: VOffsetT = 10;
    pub const VT_QUANTIZATION: VOffsetT = 12;
    pub const VT_IS_VARIABLE: VOffsetT = 14;
    pub const VT_SHAPE_SIGNATURE: VOffsetT = 18;

    pub fn shape(&self) -> Option<Vector<'a, i32>> {
        unsafe { self._tab.get::<ForwardsUOffset<Vector<'a, i32>>>(Self::VT_SHAPE, None) }
    }

    pub fn type_(&self) -> TensorType {
        TensorType(unsafe { self._tab.get::<i8>(Self::VT_TYPE_, Some(0)).unwrap_or(0) })
    }

    pub fn buffer(&self) -> u32 {
        unsafe { self._tab.get::<u32>(Self::VT_BUFFER, Some(0)).unwrap_or(0) }
    }

    pub fn name(&self) -> Option<&'a str> {
        unsafe { self._tab.get::<ForwardsUOffset<&str>>(Self::VT_NAME, None) }
    }

    pub fn quantization(&self) -> Option<QuantizationParameters<'a>> {
        unsafe { self._tab.get::<ForwardsUOffset<QuantizationParameters<'a>>>(Self::VT_QUANTIZATION, None) }
    }

    pub fn is_variable(&self) -> bool {
        unsafe { self._tab.get::<bool>(Self::VT_IS_VARIABLE, Some(false)).unwrap_or(false) }
    }

    pub fn shape_signature(&self) -> Option<Vector<'a, i32>> {
        unsafe { self._tab.get::<ForwardsUOffset<Vector<'a, i32>>>(Self::VT_SHAPE_SIGNATURE, None) }
    }
}

impl Verifiable for Tensor<'_> {
    #[inline]
    fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<ForwardsUOffset<Vector<'_, i32>>>("shape", Self::VT_SHAPE, false)?
            .visit_field::<i8>("type_", Self::VT_TYPE_, false)?
            .visit_field::<u32>("buffer", Self::VT_BUFFER, false)?
            .visit_field::<ForwardsUOffset<&str>>("name", Self::VT_NAME, false)?
            .visit_field::<ForwardsUOffset<QuantizationParameters>>("quantization", Self::VT_QUANTIZATION, false)?
            .visit_field::<bool>("is_variable", Self::VT_IS_VARIABLE, false)?
            .visit_field::<ForwardsUOffset<Vector<'_, i32>>>("shape_signature", Self::VT_SHAPE_SIGNATURE, false)?
            .finish();
        Ok(())
    }
}

schema_table!(QuantizationParameters);

impl<'a> QuantizationParameters<'a> {
    pub const VT_MIN: VOffsetT = 4;
    pub const VT_MAX: VOffsetT = 6;
    pub const VT_SCALE: VOffsetT = 8;
    pub const VT_ZERO_POINT: VOffsetT = 10;
    pub const VT_QUANTIZED_DIMENSION: VOffsetT = 16;

    pub fn scale(&self) -> Option<Vector<'a, f32>> {
        unsafe { self._tab.get::<ForwardsUOffset<Vector<'a, f32>>>(Self::VT_SCALE, None) }
    }

    pub fn zero_point(&self) -> Option<Vector<'a, i64>> {
        unsafe { self._tab.get::<ForwardsUOffset<Vector<'a, i64>>>(Self::VT_ZERO_POINT, None) }
    }

    pub fn quantized_dimension(&self) -> i32 {
        unsafe { self._tab.get::<i32>(Self::VT_QUANTIZED_DIMENSION, Some(0)).unwrap_or(0) }
    }
}

impl Verifiable for QuantizationParameters<'_> {
    #[inline]
    fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<ForwardsUOffset<Vector<'_, f32>>>("min", Self::VT_MIN, false)?
            .visit_field::<ForwardsUOffset<Vector<'_, f32>>>("max", Self::VT_MAX, false)?
            .visit_field::<ForwardsUOffset<Vector<'_, f32>>>("scale", Self::VT_SCALE, false)?
            .visit_field::<ForwardsUOffset<Vector<'_, i64>>>("zero_point", Self::VT_ZERO_POINT, false)?
            .visit_field::<i32>("quantized_dimension", Self::VT_QUANTIZED_DIMENSION, false)?
            .finish();
        Ok(())
    }
}

schema_table!(Operator);

impl<'a> Operator<'a> {
    pub const VT_OPCODE_INDEX: VOffsetT = 4;
    pub const VT_INPUTS: VOffsetT = 6;
    pub const VT_OUTPUTS: VOffsetT = 8;
    pub const VT_BUILTIN_OPTIONS_TYPE: VOffsetT = 10;
    pub const VT_BUILTIN_OPTIONS: VOffsetT = 12;

    pub fn opcode_index(&self) -> u32 {
        unsafe { self._tab.get::<u32>(Self::VT_OPCODE_INDEX, Some(0)).unwrap_or(0) }
    }

    pub fn inputs(&self) -> Option<Vector<'a, i32>> {
        unsafe { self._tab.get::<ForwardsUOffset<Vector<'a, i32>>>(Self::VT_INPUTS, None) }
    }

    pub fn outputs(&self) -> Option<Vector<'a, i32>> {
        unsafe { self._tab.get::<ForwardsUOffset<Vector<'a, i32>>>(Self::VT_OUTPUTS, None) }
    }

    pub fn builtin_options_type(&self) -> BuiltinOptions {
        BuiltinOptions(unsafe { self._tab.get::<u8>(Self::VT_BUILTIN_OPTIONS_TYPE, Some(0)).unwrap_or(0) })
    }

    pub fn builtin_options(&self) -> Option<Table<'a>> {
        unsafe { self._tab.get::<ForwardsUOffset<Table<'a>>>(Self::VT_BUILTIN_OPTIONS, None) }
    }

    /// The options table viewed as `T` when the union tag is `tag`.
    pub fn builtin_options_as<T: From<Table<'a>>>(&self, tag: BuiltinOptions) -> Option<T> {
        if self.builtin_options_type() == tag {
            self.builtin_options().map(T::from)
        } else {
            None
        }
    }
}

impl Verifiable for Operator<'_> {
    #[inline]
    fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<u32>("opcode_index", Self::VT_OPCODE_INDEX, false)?
            .visit_field::<ForwardsUOffset<Vector<'_, i32>>>("inputs", Self::VT_INPUTS, false)?
            .visit_field::<ForwardsUOffset<Vector<'_, i32>>>("outputs", Self::VT_OUTPUTS, false)?
            .visit_union::<u8, _>(
                "builtin_options_type",
                Self::VT_BUILTIN_OPTIONS_TYPE,
                "builtin_options",
                Self::VT_BUILTIN_OPTIONS,
                false,
                |key, v, pos| match BuiltinOptions(key) {
                    BuiltinOptions::NONE => Ok(()),
                    BuiltinOptions::Conv2DOptions => v.verify_union_variant::<ForwardsUOffset<Conv2DOptions>>("Conv2DOptions", pos),
                    BuiltinOptions::DepthwiseConv2DOptions => {
                        v.verify_union_variant::<ForwardsUOffset<DepthwiseConv2DOptions>>("DepthwiseConv2DOptions", pos)
                    }
                    BuiltinOptions::Pool2DOptions => v.verify_union_variant::<ForwardsUOffset<Pool2DOptions>>("Pool2DOptions", pos),
                    BuiltinOptions::FullyConnectedOptions => {
                        v.verify_union_variant::<ForwardsUOffset<FullyConnectedOptions>>("FullyConnectedOptions", pos)
                    }
                    BuiltinOptions::SoftmaxOptions => v.verify_union_variant::<ForwardsUOffset<SoftmaxOptions>>("SoftmaxOptions", pos),
                    BuiltinOptions::ConcatenationOptions => {
                        v.verify_union_variant::<ForwardsUOffset<ConcatenationOptions>>("ConcatenationOptions", pos)
                    }
                    BuiltinOptions::ReshapeOptions => v.verify_union_variant::<ForwardsUOffset<ReshapeOptions>>("ReshapeOptions", pos),
                    BuiltinOptions::ReducerOptions => v.verify_union_variant::<ForwardsUOffset<ReducerOptions>>("ReducerOptions", pos),
                    // Add/Sub/Mul/Div options are a single activation byte (plus an
                    // optional bool); the remaining tags are empty tables.
                    _ => v.verify_union_variant::<ForwardsUOffset<ActivationOptions>>("BuiltinOptions", pos),
                },
            )?
            .finish();
        Ok(())
    }
}

schema_table!(Buffer);

impl<'a> Buffer<'a> {
    pub const VT_DATA: VOffsetT = 4;

    pub fn data(&self) -> Option<Vector<'a, u8>> {
        unsafe { self._tab.get::<ForwardsUOffset<Vector<'a, u8>>>(Self::VT_DATA, None) }
    }
}

impl Verifiable for Buffer<'_> {
    #[inline]
    fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<ForwardsUOffset<Vector<'_, u8>>>("data", Self::VT_DATA, false)?
            .finish();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Builtin option tables
// ---------------------------------------------------------------------------

macro_rules! options_table {
    ($name:ident { $($field:ident : $ty:ty = $vt:expr, default $default:expr;)* }) => {
        schema_table!($name);

        #[allow(non_upper_case_globals)]
        impl<'a> $name<'a> {
            $(
                pub fn $field(&self) -> $ty {
                    unsafe { self._tab.get::<$ty>($vt, Some($default)).unwrap_or($default) }
                }
            )*
        }

        impl<'a> From<Table<'a>> for $name<'a> {
            fn from(table: Table<'a>) -> Self {
                unsafe { Self::init_from_table(table) }
            }
        }

        impl Verifiable for $name<'_> {
            #[inline]
            fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
                v.visit_table(pos)?
                    $(.visit_field::<$ty>(stringify!($field), $vt, false)?)*
                    .finish();
                Ok(())
            }
        }
    };
}

/// Slot offsets shared by the option tables (read and write side).
pub mod vt {
    use flatbuffers::VOffsetT;

    pub const fn field(index: VOffsetT) -> VOffsetT {
        4 + 2 * index
    }
}

options_table!(Conv2DOptions {
    padding_raw: i8 = vt::field(0), default 0;
    stride_w: i32 = vt::field(1), default 0;
    stride_h: i32 = vt::field(2), default 0;
    fused_activation_function_raw: i8 = vt::field(3), default 0;
    dilation_w_factor: i32 = vt::field(4), default 1;
    dilation_h_factor: i32 = vt::field(5), default 1;
});

options_table!(DepthwiseConv2DOptions {
    padding_raw: i8 = vt::field(0), default 0;
    stride_w: i32 = vt::field(1), default 0;
    stride_h: i32 = vt::field(2), default 0;
    depth_multiplier: i32 = vt::field(3), default 0;
    fused_activation_function_raw: i8 = vt::field(4), default 0;
    dilation_w_factor: i32 = vt::field(5), default 1;
    dilation_h_factor: i32 = vt::field(6), default 1;
});

options_table!(Pool2DOptions {
    padding_raw: i8 = vt::field(0), default 0;
    stride_w: i32 = vt::field(1), default 0;
    stride_h: i32 = vt::field(2), default 0;
    filter_width: i32 = vt::field(3), default 0;
    filter_height: i32 = vt::field(4), default 0;
    fused_activation_function_raw: i8 = vt::field(5), default 0;
});

options_table!(FullyConnectedOptions {
    fused_activation_function_raw: i8 = vt::field(0), default 0;
    weights_format: i8 = vt::field(1), default 0;
    keep_num_dims: bool = vt::field(2), default false;
    asymmetric_quantize_inputs: bool = vt::field(3), default false;
});

options_table!(SoftmaxOptions {
    beta: f32 = vt::field(0), default 0.0;
});

options_table!(ConcatenationOptions {
    axis: i32 = vt::field(0), default 0;
    fused_activation_function_raw: i8 = vt::field(1), default 0;
});

options_table!(ReducerOptions {
    keep_dims: bool = vt::field(0), default false;
});

// Add/Sub/Mul/Div options: activation in slot 0, `pot_scale_int16` in slot 1.
options_table!(ActivationOptions {
    fused_activation_function_raw: i8 = vt::field(0), default 0;
    pot_scale_int16: bool = vt::field(1), default true;
});

schema_table!(ReshapeOptions);

impl<'a> ReshapeOptions<'a> {
    pub const VT_NEW_SHAPE: VOffsetT = vt::field(0);

    pub fn new_shape(&self) -> Option<Vector<'a, i32>> {
        unsafe { self._tab.get::<ForwardsUOffset<Vector<'a, i32>>>(Self::VT_NEW_SHAPE, None) }
    }
}

impl<'a> From<Table<'a>> for ReshapeOptions<'a> {
    fn from(table: Table<'a>) -> Self {
        unsafe { Self::init_from_table(table) }
    }
}

impl Verifiable for ReshapeOptions<'_> {
    #[inline]
    fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<ForwardsUOffset<Vector<'_, i32>>>("new_shape", Self::VT_NEW_SHAPE, false)?
            .finish();
        Ok(())
    }
}

/// Verify and open a model buffer.
pub fn root_as_model(buf: &[u8]) -> Result<Model<'_>, InvalidFlatbuffer> {
    flatbuffers::root::<Model>(buf)
}

/// Whether `buf` carries the `TFL3` file identifier.
pub fn model_buffer_has_identifier(buf: &[u8]) -> bool {
    flatbuffers::buffer_has_identifier(buf, FILE_IDENTIFIER, false)
}
