use std::io::{Read, Write};

use anyhow::{Context, Result};

/// Big-endian primitive writers shared by the suite and probe-log formats.
pub(crate) fn write_u8<W: Write>(out: &mut W, value: u8) -> Result<()> {
    out.write_all(&[value]).context("write u8")
}

pub(crate) fn write_u16<W: Write>(out: &mut W, value: u16) -> Result<()> {
    out.write_all(&value.to_be_bytes()).context("write u16")
}

pub(crate) fn write_u32<W: Write>(out: &mut W, value: u32) -> Result<()> {
    out.write_all(&value.to_be_bytes()).context("write u32")
}

pub(crate) fn write_i32<W: Write>(out: &mut W, value: i32) -> Result<()> {
    out.write_all(&value.to_be_bytes()).context("write i32")
}

pub(crate) fn write_bool<W: Write>(out: &mut W, value: bool) -> Result<()> {
    write_u8(out, if value { 1 } else { 0 })
}

/// Length-prefixed UTF-8 string, `u16` length like class-file CONSTANT_Utf8.
pub(crate) fn write_utf<W: Write>(out: &mut W, value: &str) -> Result<()> {
    let bytes = value.as_bytes();
    if bytes.len() > u16::MAX as usize {
        anyhow::bail!("string too long for wire format: {} bytes", bytes.len());
    }
    write_u16(out, bytes.len() as u16)?;
    out.write_all(bytes).context("write utf bytes")
}

pub(crate) fn read_u8<R: Read>(input: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    input.read_exact(&mut buf).context("read u8")?;
    Ok(buf[0])
}

pub(crate) fn read_u16<R: Read>(input: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    input.read_exact(&mut buf).context("read u16")?;
    Ok(u16::from_be_bytes(buf))
}

pub(crate) fn read_u32<R: Read>(input: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf).context("read u32")?;
    Ok(u32::from_be_bytes(buf))
}

pub(crate) fn read_i32<R: Read>(input: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf).context("read i32")?;
    Ok(i32::from_be_bytes(buf))
}

pub(crate) fn read_bool<R: Read>(input: &mut R) -> Result<bool> {
    Ok(read_u8(input)? != 0)
}

pub(crate) fn read_utf<R: Read>(input: &mut R) -> Result<String> {
    let len = read_u16(input)? as usize;
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf).context("read utf bytes")?;
    String::from_utf8(buf).context("utf string is not valid UTF-8")
}
