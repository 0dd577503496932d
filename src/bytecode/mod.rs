//! `.luac` binary chunk reader. Writing is not implemented.
//!
//! Grounded on a bytecode-toolkit `Reader<R: Read>` + `check!` macro
//! style, adapted to Lua 5.3's actual header layout and little-endian
//! fixed-width fields (the toolkit this was modeled on reads native
//! endian and a 4-byte string-length continuation; real `.luac` files
//! are little-endian with an 8-byte continuation, which is what's
//! implemented here).

use std::io::{self, Read};

use byteorder::{LittleEndian as LE, ReadBytesExt};

use crate::error::{LuaError, LuaResult};
use crate::value::{Constant, LuaString, Prototype, UpvalDesc};
use std::rc::Rc;

const SIGNATURE: &[u8; 4] = b"\x1bLua";
const VERSION: u8 = 0x53;
const FORMAT: u8 = 0;
const LUAC_DATA: [u8; 6] = [0x19, 0x93, 0x0d, 0x0a, 0x1a, 0x0a];
const TEST_INT: i64 = 0x5678;
const TEST_NUMBER: f64 = 370.5;

fn load_err(msg: impl Into<String>) -> LuaError {
    LuaError::Load { message: msg.into() }
}

fn io_to_load(e: io::Error) -> LuaError {
    load_err(format!("{}", e))
}

macro_rules! check {
    ($get:expr, $want:expr, $note:expr) => {{
        let get = $get;
        let want = $want;
        if get != want {
            return Err(load_err(format!(
                "invalid {}: expected {:?}, got {:?}",
                $note, want, get
            )));
        }
    }};
}

pub struct Reader<R: Read> {
    inner: R,
}

impl<R: Read> Reader<R> {
    pub fn new(inner: R) -> Self {
        Reader { inner }
    }

    /// Reads a whole chunk: header, then the top-level function
    /// (wrapped as the main vararg closure's prototype).
    pub fn read_chunk(mut self) -> LuaResult<Rc<Prototype>> {
        self.read_header()?;
        // One upvalue count byte precedes the main function: always 1
        // (the `_ENV` upvalue) for a well-formed chunk, but not
        // otherwise checked.
        self.u8()?;
        self.read_function()
    }

    fn read_header(&mut self) -> LuaResult<()> {
        let mut sig = [0u8; 4];
        self.read_exact(&mut sig)?;
        check!(&sig, SIGNATURE, "signature");
        check!(self.u8()?, VERSION, "version");
        check!(self.u8()?, FORMAT, "format");
        let mut data = [0u8; 6];
        self.read_exact(&mut data)?;
        check!(data, LUAC_DATA, "luac data");
        check!(self.u8()?, 4, "sizeof(int)");
        check!(self.u8()?, 8, "sizeof(size_t)");
        check!(self.u8()?, 4, "sizeof(Instruction)");
        check!(self.u8()?, 8, "sizeof(lua_Integer)");
        check!(self.u8()?, 8, "sizeof(lua_Number)");
        let number = self.inner.read_f64::<LE>().map_err(io_to_load)?;
        check!(number, TEST_NUMBER, "test number");
        let int = self.inner.read_i64::<LE>().map_err(io_to_load)?;
        check!(int, TEST_INT, "test integer");
        Ok(())
    }

    fn read_function(&mut self) -> LuaResult<Rc<Prototype>> {
        let source_bytes = self.read_string()?;
        let source = source_bytes
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default();
        let line_defined = self.u32()?;
        let last_line_defined = self.u32()?;
        let num_params = self.u8()?;
        let is_vararg = self.u8()? != 0;
        let max_stack_size = self.u8()?;
        let code = self.read_vec(Self::u32_instr)?;
        let constants = self.read_vec(Self::read_constant)?;
        let upvalues = self.read_vec(Self::read_upvaldesc)?;
        let protos = self.read_vec(Self::read_function)?;
        let line_info = self.read_vec(Self::u32)?;
        // Local variable debug entries: name, startpc, endpc.
        let local_names = self.read_vec(|this| {
            let name = this.read_string()?;
            this.u32()?; // startpc
            this.u32()?; // endpc
            Ok(name
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default())
        })?;
        // Upvalue debug names.
        let _upvalue_names = self.read_vec(Self::read_string)?;

        Ok(Rc::new(Prototype {
            num_params,
            is_vararg,
            max_stack_size,
            code,
            constants,
            upvalues,
            protos,
            line_info,
            source,
            line_defined,
            last_line_defined,
            local_names,
        }))
    }

    fn read_constant(&mut self) -> LuaResult<Constant> {
        let tag = self.u8()?;
        Ok(match tag {
            0x00 => Constant::Nil,
            0x01 => Constant::Bool(self.u8()? != 0),
            0x03 => Constant::Float(self.inner.read_f64::<LE>().map_err(io_to_load)?),
            0x13 => Constant::Int(self.inner.read_i64::<LE>().map_err(io_to_load)?),
            0x04 | 0x14 => {
                let bytes = self
                    .read_string()?
                    .ok_or_else(|| load_err("empty string constant"))?;
                Constant::Str(LuaString::new(bytes))
            }
            other => return Err(load_err(format!("unknown constant tag 0x{:02x}", other))),
        })
    }

    fn read_upvaldesc(&mut self) -> LuaResult<UpvalDesc> {
        let in_stack = self.u8()? != 0;
        let index = self.u8()? as u32;
        Ok(UpvalDesc {
            in_stack,
            index,
            name: None,
        })
    }

    /// Lua's "short string optimisation" length prefix: `0` means `nil`
    /// (no string present, e.g. an unnamed upvalue debug entry), `0xFF`
    /// means an 8-byte length follows, anything else is `byte - 1`.
    fn read_string(&mut self) -> LuaResult<Option<Vec<u8>>> {
        let first = self.u8()?;
        let len = if first == 0 {
            return Ok(None);
        } else if first == 0xFF {
            self.inner.read_u64::<LE>().map_err(io_to_load)? as usize
        } else {
            first as usize - 1
        };
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(Some(buf))
    }

    fn read_vec<T>(&mut self, mut f: impl FnMut(&mut Self) -> LuaResult<T>) -> LuaResult<Vec<T>> {
        let len = self.u32()? as usize;
        let mut out = Vec::with_capacity(len.min(1 << 16));
        for _ in 0..len {
            out.push(f(self)?);
        }
        Ok(out)
    }

    fn u8(&mut self) -> LuaResult<u8> {
        self.inner.read_u8().map_err(io_to_load)
    }

    fn u32(&mut self) -> LuaResult<u32> {
        self.inner.read_u32::<LE>().map_err(io_to_load)
    }

    fn u32_instr(&mut self) -> LuaResult<u32> {
        self.u32()
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> LuaResult<()> {
        self.inner.read_exact(buf).map_err(io_to_load)
    }
}

/// Loads a compiled chunk from any `Read` source.
pub fn load<R: Read>(reader: R) -> LuaResult<Rc<Prototype>> {
    Reader::new(reader).read_chunk()
}

/// Loads a compiled chunk from an in-memory byte slice.
pub fn load_bytes(bytes: &[u8]) -> LuaResult<Rc<Prototype>> {
    load(bytes)
}
