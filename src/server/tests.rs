use super::protocol::{
    format_samples, format_status, parse_command, read_frame, Command, Frame, ProtocolError,
    MAX_LINE_BYTES,
};
use crate::audio::{SampleFormat, StreamState};
use std::io::{BufReader, Cursor};

#[test]
fn parses_get_and_set() {
    assert_eq!(parse_command("GET"), Ok(Command::Get));
    assert_eq!(parse_command("SET|8000#64"), Ok(Command::Set("8000#64")));
    assert_eq!(parse_command("SET|"), Ok(Command::Set("")));
    assert_eq!(parse_command("SET|8000#64|extra"), Ok(Command::Set("8000#64")));
    assert_eq!(parse_command("GET|ignored"), Ok(Command::Get));
}

#[test]
fn rejects_set_without_argument() {
    assert_eq!(
        parse_command("SET"),
        Err(ProtocolError::MissingArgument("SET"))
    );
}

#[test]
fn unknown_commands_are_case_sensitive() {
    assert_eq!(
        parse_command("get"),
        Err(ProtocolError::Unknown("get".to_string()))
    );
    assert_eq!(
        parse_command("PING|1"),
        Err(ProtocolError::Unknown("PING".to_string()))
    );
    assert_eq!(parse_command(""), Err(ProtocolError::Empty));
}

#[test]
fn formats_status_line() {
    let state = StreamState {
        active: true,
        capture_rate: 48_000,
        sample_format: SampleFormat::Int24,
        device_index: None,
    };
    assert_eq!(
        format_status(&state).unwrap(),
        r#"DST|{"active":true,"fs":48000,"format":"paInt24","device_idx":null}"#
    );
}

#[test]
fn formats_data_line() {
    assert_eq!(format_samples(&[0.5, -0.25, 0.0]), "DAT|0.5|-0.25|0");
    assert_eq!(format_samples(&[]), "DAT");
    let line = format_samples(&[0.1, 1e-7]);
    let parsed: Vec<f32> = line
        .split('|')
        .skip(1)
        .map(|field| field.parse().unwrap())
        .collect();
    assert_eq!(parsed, vec![0.1f32, 1e-7]);
}

#[test]
fn reads_lf_and_crlf_lines() {
    let mut reader = BufReader::new(Cursor::new(b"GET\r\nSET|8000#64\nPARTIAL".to_vec()));
    let mut buf = Vec::new();
    assert_eq!(read_frame(&mut reader, &mut buf).unwrap(), Frame::Line);
    assert_eq!(buf, b"GET");
    assert_eq!(read_frame(&mut reader, &mut buf).unwrap(), Frame::Line);
    assert_eq!(buf, b"SET|8000#64");
    assert_eq!(read_frame(&mut reader, &mut buf).unwrap(), Frame::Closed);
    assert_eq!(read_frame(&mut reader, &mut buf).unwrap(), Frame::Closed);
}

#[test]
fn accepts_line_at_limit() {
    let mut data = vec![b'x'; MAX_LINE_BYTES];
    data.extend_from_slice(b"\r\nGET\n");
    let mut reader = BufReader::new(Cursor::new(data));
    let mut buf = Vec::new();
    assert_eq!(read_frame(&mut reader, &mut buf).unwrap(), Frame::Line);
    assert_eq!(buf.len(), MAX_LINE_BYTES);
    assert_eq!(read_frame(&mut reader, &mut buf).unwrap(), Frame::Line);
    assert_eq!(buf, b"GET");
}

#[test]
fn flags_oversized_lines() {
    let mut data = vec![b'x'; MAX_LINE_BYTES + 1];
    data.push(b'\n');
    let mut reader = BufReader::new(Cursor::new(data));
    let mut buf = Vec::new();
    assert_eq!(read_frame(&mut reader, &mut buf).unwrap(), Frame::Oversized);

    let data = vec![b'y'; MAX_LINE_BYTES * 2];
    let mut reader = BufReader::new(Cursor::new(data));
    assert_eq!(read_frame(&mut reader, &mut buf).unwrap(), Frame::Oversized);
}
