//! RPC (Remote Procedure Call) request encoding.
//!
//! ## Wire Format
//!
//! ```text
//! RPC Request:
//! +-------------------+
//! | ProcName/ProcID   | us_varchar name, or 0xFFFF + u16 id (TDS 7.x)
//! +-------------------+
//! | Option Flags      | (2 bytes)
//! +-------------------+
//! | Parameters        | name, status, TYPE_INFO, value (repeated)
//! +-------------------+
//! ```
//!
//! TDS 4.2 and 5.0 give the name a one-byte length in the session charset.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use tds_types::{
    CodecOptions, ParamDescriptor, ParamDirection, encode_type, encode_value, resolve_param_type,
};

use crate::codec::{write_b_varchar, write_us_varchar};
use crate::error::ProtocolError;
use crate::version::TdsVersion;

/// Name length marker announcing a procedure id.
const PROC_ID_MARKER: u16 = 0xFFFF;

/// Well-known stored procedure IDs.
///
/// These are special procedure IDs that SQL Server recognizes
/// without requiring the procedure name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ProcId {
    /// sp_cursor (0x0001)
    Cursor = 0x0001,
    /// sp_cursoropen (0x0002)
    CursorOpen = 0x0002,
    /// sp_cursorprepare (0x0003)
    CursorPrepare = 0x0003,
    /// sp_cursorexecute (0x0004)
    CursorExecute = 0x0004,
    /// sp_cursorprepexec (0x0005)
    CursorPrepExec = 0x0005,
    /// sp_cursorunprepare (0x0006)
    CursorUnprepare = 0x0006,
    /// sp_cursorfetch (0x0007)
    CursorFetch = 0x0007,
    /// sp_cursoroption (0x0008)
    CursorOption = 0x0008,
    /// sp_cursorclose (0x0009)
    CursorClose = 0x0009,
    /// sp_executesql (0x000A)
    ExecuteSql = 0x000A,
    /// sp_prepare (0x000B)
    Prepare = 0x000B,
    /// sp_execute (0x000C)
    Execute = 0x000C,
    /// sp_prepexec (0x000D)
    PrepExec = 0x000D,
    /// sp_prepexecrpc (0x000E)
    PrepExecRpc = 0x000E,
    /// sp_unprepare (0x000F)
    Unprepare = 0x000F,
}

impl ProcId {
    /// Look up the shortcut id of a system procedure name.
    ///
    /// Matching ignores ASCII case. Qualified names never map to an id.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let id = match name.to_ascii_lowercase().as_str() {
            "sp_cursor" => Self::Cursor,
            "sp_cursoropen" => Self::CursorOpen,
            "sp_cursorprepare" => Self::CursorPrepare,
            "sp_cursorexecute" => Self::CursorExecute,
            "sp_cursorprepexec" => Self::CursorPrepExec,
            "sp_cursorunprepare" => Self::CursorUnprepare,
            "sp_cursorfetch" => Self::CursorFetch,
            "sp_cursoroption" => Self::CursorOption,
            "sp_cursorclose" => Self::CursorClose,
            "sp_executesql" => Self::ExecuteSql,
            "sp_prepare" => Self::Prepare,
            "sp_execute" => Self::Execute,
            "sp_prepexec" => Self::PrepExec,
            "sp_prepexecrpc" => Self::PrepExecRpc,
            "sp_unprepare" => Self::Unprepare,
            _ => return None,
        };
        Some(id)
    }
}

bitflags! {
    /// RPC option flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RpcOptionFlags: u16 {
        /// Recompile the procedure.
        const WITH_RECOMPILE = 0x0001;
        /// No metadata in response.
        const NO_METADATA = 0x0002;
    }
}

/// Parameter status byte: the server returns the value.
const STATUS_BY_REF: u8 = 0x01;

/// RPC request builder.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    proc_name: String,
    options: RpcOptionFlags,
    params: Vec<ParamDescriptor>,
}

impl RpcRequest {
    /// Create a new RPC request for a named procedure.
    pub fn new(proc_name: impl Into<String>) -> Self {
        Self {
            proc_name: proc_name.into(),
            options: RpcOptionFlags::empty(),
            params: Vec::new(),
        }
    }

    /// Set option flags.
    #[must_use]
    pub fn with_options(mut self, options: RpcOptionFlags) -> Self {
        self.options = options;
        self
    }

    /// Add a parameter.
    #[must_use]
    pub fn param(mut self, param: ParamDescriptor) -> Self {
        self.params.push(param);
        self
    }

    /// Procedure name.
    #[must_use]
    pub fn proc_name(&self) -> &str {
        &self.proc_name
    }

    /// Bound parameters, including any return-value slot.
    #[must_use]
    pub fn params(&self) -> &[ParamDescriptor] {
        &self.params
    }

    /// Encode the RPC payload for the negotiated version.
    ///
    /// The return-value slot is a client-side placeholder and is not sent.
    pub fn encode(&self, version: TdsVersion, opts: &CodecOptions) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(64 + self.params.len() * 16);

        match ProcId::from_name(&self.proc_name) {
            Some(id) if version.supports_proc_ids() => {
                buf.put_u16_le(PROC_ID_MARKER);
                buf.put_u16_le(id as u16);
            }
            _ if version.is_tds7() => write_us_varchar(&mut buf, &self.proc_name, opts)?,
            _ => write_b_varchar(&mut buf, &self.proc_name, opts)?,
        }

        buf.put_u16_le(self.options.bits());

        for param in &self.params {
            if param.direction == ParamDirection::Return {
                continue;
            }
            write_b_varchar(&mut buf, &param.name, opts)?;
            buf.put_u8(if param.direction.is_output() {
                STATUS_BY_REF
            } else {
                0
            });
            let col = resolve_param_type(param, opts)?;
            encode_type(&col, opts, &mut buf);
            encode_value(&param.value, &col, opts, &mut buf)?;
        }

        Ok(buf.freeze())
    }
}
