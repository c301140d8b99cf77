//! Parameter descriptors for RPC requests.

use crate::type_id::TypeId;
use crate::value::SqlValue;

/// Direction of a bound parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamDirection {
    /// Sent to the server only.
    In,
    /// Filled by the server; the sent value is ignored.
    Out,
    /// Sent and filled by the server.
    InOut,
    /// Receives the procedure return status or function return value.
    Return,
}

impl ParamDirection {
    /// Whether the server writes this parameter back.
    #[must_use]
    pub fn is_output(self) -> bool {
        matches!(self, Self::Out | Self::InOut | Self::Return)
    }
}

/// A parameter bound to one RPC request.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDescriptor {
    /// Parameter name including the leading `@`, or empty for positional.
    pub name: String,
    /// Direction.
    pub direction: ParamDirection,
    /// Value to send (NULL for pure output parameters).
    pub value: SqlValue,
    /// Wire type to declare; inferred from `value` when `None`.
    pub wire_type: Option<TypeId>,
    /// Scale for decimal parameters declared with an explicit wire type.
    pub scale: u8,
}

impl ParamDescriptor {
    /// An input parameter.
    pub fn input(name: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        Self {
            name: name.into(),
            direction: ParamDirection::In,
            value: value.into(),
            wire_type: None,
            scale: 0,
        }
    }

    /// An output parameter of the given wire type.
    pub fn output(name: impl Into<String>, wire_type: TypeId) -> Self {
        Self {
            name: name.into(),
            direction: ParamDirection::Out,
            value: SqlValue::Null,
            wire_type: Some(wire_type),
            scale: 0,
        }
    }

    /// An input/output parameter.
    pub fn in_out(name: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        Self {
            direction: ParamDirection::InOut,
            ..Self::input(name, value)
        }
    }

    /// The return-value slot. It is never sent on the wire.
    #[must_use]
    pub fn return_value() -> Self {
        Self {
            name: String::new(),
            direction: ParamDirection::Return,
            value: SqlValue::Null,
            wire_type: Some(TypeId::IntN),
            scale: 0,
        }
    }

    /// Override the declared wire type.
    #[must_use]
    pub fn with_wire_type(mut self, wire_type: TypeId) -> Self {
        self.wire_type = Some(wire_type);
        self
    }

    /// Set the scale used for an explicitly typed decimal.
    #[must_use]
    pub fn with_scale(mut self, scale: u8) -> Self {
        self.scale = scale;
        self
    }
}
