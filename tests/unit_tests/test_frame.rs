// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use hex_literal::hex;
use soulseek_client_rs::{
    error::CodecError,
    models::frame::{Message, MessageBuilder, MessageReader},
};

#[test]
fn test_builder_reader_round_trip() -> Result<()> {
    let msg = MessageBuilder::new()
        .write_code(18u32)
        .write_byte(7)
        .write_i32(-42)
        .write_u32(0xdead_beef)
        .write_i64(-1_234_567_890_123)
        .write_string("héllo wörld")
        .write_bytes(&[1, 2, 3])
        .build()?;

    let mut r = MessageReader::new(&msg);
    assert_eq!(msg.code, 18);
    assert_eq!(r.read_byte()?, 7);
    assert_eq!(r.read_i32()?, -42);
    assert_eq!(r.read_u32()?, 0xdead_beef);
    assert_eq!(r.read_i64()?, -1_234_567_890_123);
    assert_eq!(r.read_string()?, "héllo wörld");
    assert_eq!(&r.read_bytes(3)?[..], &[1, 2, 3]);
    assert!(!r.has_more());
    Ok(())
}

#[test]
fn test_wire_layout_is_exact() -> Result<()> {
    // code 1, string "ab", u32 5 → len = 4 + (4+2) + 4 = 14
    let msg = MessageBuilder::new()
        .write_code(1u32)
        .write_string("ab")
        .write_u32(5)
        .build()?;
    let bytes = msg.to_bytes();
    assert_eq!(
        &bytes[..],
        hex!(
            "0e000000"  // payload length (code + payload), LE
            "01000000"  // code 1
            "02000000" "6162" // "ab"
            "05000000"  // 5
        )
    );
    Ok(())
}

#[test]
fn test_from_frame_round_trip() -> Result<()> {
    let msg = MessageBuilder::new()
        .write_code(93u32)
        .write_string("query")
        .build()?;
    let parsed = Message::from_frame(&msg.to_bytes())?;
    assert_eq!(parsed, msg);
    Ok(())
}

#[test]
fn test_from_frame_truncated() {
    let msg = MessageBuilder::new()
        .write_code(5u32)
        .write_u32(9)
        .build()
        .expect("build");
    let bytes = msg.to_bytes();
    let err = Message::from_frame(&bytes[..bytes.len() - 1]).unwrap_err();
    assert!(matches!(err, CodecError::TruncatedField { .. }));
}

#[test]
fn test_read_past_end_fails() -> Result<()> {
    let msg = MessageBuilder::new().write_code(7u32).write_byte(1).build()?;
    let mut r = MessageReader::new(&msg);
    assert_eq!(r.read_byte()?, 1);
    let err = r.read_i32().unwrap_err();
    assert!(matches!(err, CodecError::TruncatedField { .. }));
    Ok(())
}

#[test]
fn test_string_overrun() -> Result<()> {
    // Length prefix claims 100 bytes; only 2 follow.
    let msg = MessageBuilder::new()
        .write_code(3u32)
        .write_i32(100)
        .write_bytes(b"ab")
        .build()?;
    let mut r = MessageReader::new(&msg);
    let err = r.read_string().unwrap_err();
    assert!(matches!(err, CodecError::StringOverrun { declared: 100, .. }));
    Ok(())
}

#[test]
fn test_negative_string_length_is_overrun() -> Result<()> {
    let msg = MessageBuilder::new().write_code(3u32).write_i32(-1).build()?;
    let mut r = MessageReader::new(&msg);
    assert!(matches!(
        r.read_string().unwrap_err(),
        CodecError::StringOverrun { declared: -1, .. }
    ));
    Ok(())
}

#[test]
fn test_seek_and_position() -> Result<()> {
    let msg = MessageBuilder::new()
        .write_code(9u32)
        .write_u32(1)
        .write_u32(2)
        .build()?;
    let mut r = MessageReader::new(&msg);
    assert_eq!(r.position(), 0);
    assert_eq!(r.read_u32()?, 1);
    assert_eq!(r.position(), 4);
    r.seek(0)?;
    assert_eq!(r.read_u32()?, 1);
    r.seek(4)?;
    assert_eq!(r.read_u32()?, 2);
    assert!(matches!(
        r.seek(99).unwrap_err(),
        CodecError::SeekOutOfBounds { pos: 99, .. }
    ));
    Ok(())
}

#[test]
fn test_compressed_round_trip() -> Result<()> {
    let long = "a very repetitive payload ".repeat(50);
    let msg = MessageBuilder::new()
        .write_code(9u32)
        .write_string(&long)
        .write_u32(77)
        .compress()
        .build()?;
    // Compression actually shrank the repetitive payload.
    assert!(msg.payload.len() < long.len());

    let mut r = MessageReader::new(&msg);
    r.decompress()?;
    assert_eq!(r.read_string()?, long);
    assert_eq!(r.read_u32()?, 77);
    Ok(())
}

#[test]
fn test_decompress_garbage_fails() {
    let msg = Message::new(9, bytes::Bytes::from_static(b"not zlib at all"));
    let mut r = MessageReader::new(&msg);
    assert!(matches!(r.decompress().unwrap_err(), CodecError::Decompress(_)));
}

#[test]
fn test_ip_field_reversed_octets() -> Result<()> {
    // 1.2.3.4 is carried as the host-order integer 0x01020304.
    let msg = MessageBuilder::new()
        .write_code(3u32)
        .write_u32(0x0102_0304)
        .build()?;
    let mut r = MessageReader::new(&msg);
    assert_eq!(r.read_ip()?, std::net::Ipv4Addr::new(1, 2, 3, 4));
    Ok(())
}
