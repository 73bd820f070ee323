//! Binary encode/decode primitives for the on-disk summary format:
//! fixed-width little-endian integers and length-prefixed UTF-8
//! strings.

use std::io::{self, Read, Write};

/// Upper bound for a single encoded string, to keep a corrupt length
/// prefix from allocating unbounded memory.
const MAX_STRING_LEN: u32 = 16 * 1024 * 1024;

pub(crate) fn write_u32(w: &mut (impl Write + ?Sized), value: u32) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

pub(crate) fn read_u32(r: &mut (impl Read + ?Sized)) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn write_i64(w: &mut (impl Write + ?Sized), value: i64) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

pub(crate) fn read_i64(r: &mut (impl Read + ?Sized)) -> io::Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

pub(crate) fn write_string(w: &mut (impl Write + ?Sized), value: &str) -> io::Result<()> {
    write_u32(w, value.len() as u32)?;
    w.write_all(value.as_bytes())
}

pub(crate) fn read_string(r: &mut (impl Read + ?Sized)) -> io::Result<String> {
    let len = read_u32(r)?;
    if len > MAX_STRING_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "summary string length out of range",
        ));
    }

    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;

    String::from_utf8(buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "summary string is not UTF-8"))
}

pub(crate) fn write_string_list(w: &mut impl Write, values: &[String]) -> io::Result<()> {
    write_u32(w, values.len() as u32)?;
    for value in values {
        write_string(w, value)?;
    }
    Ok(())
}

pub(crate) fn read_string_list(r: &mut impl Read) -> io::Result<Vec<String>> {
    let count = read_u32(r)?;
    let mut values = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        values.push(read_string(r)?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_round_trip() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 0xdeadbeef).unwrap();
        write_i64(&mut buf, -42).unwrap();

        let mut r = buf.as_slice();
        assert_eq!(read_u32(&mut r).unwrap(), 0xdeadbeef);
        assert_eq!(read_i64(&mut r).unwrap(), -42);
    }

    #[test]
    fn strings_round_trip() {
        let mut buf = Vec::new();
        write_string(&mut buf, "héllo").unwrap();
        write_string_list(&mut buf, &["<a@b>".into(), "<c@d>".into()]).unwrap();

        let mut r = buf.as_slice();
        assert_eq!(read_string(&mut r).unwrap(), "héllo");
        assert_eq!(
            read_string_list(&mut r).unwrap(),
            vec!["<a@b>".to_owned(), "<c@d>".to_owned()]
        );
    }

    #[test]
    fn oversized_string_is_rejected() {
        let mut buf = Vec::new();
        write_u32(&mut buf, u32::MAX).unwrap();
        assert!(read_string(&mut buf.as_slice()).is_err());
    }
}
