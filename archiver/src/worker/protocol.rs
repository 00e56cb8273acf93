//! Wire framing and message shapes for the parent/child worker protocol
//! (§4.E, §6 "Worker IPC wire format"). Every frame is `length:u32-be ||
//! pack-bytes`; every pack opens with an implicit object frame.

use crate::context::RepoCandidate;
use crate::error::ArchiveError;
use crate::io::CipherType;
use crate::pack::{PackReader, PackType, PackWriter};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Sentinel for "no candidate matched" in the response's field 1 (a real
/// candidate index never reaches `u32::MAX` in practice).
const NOT_FOUND_SENTINEL: u32 = u32::MAX;

#[derive(Debug, Clone)]
pub struct ArchiveGetParams {
    pub segment_name: String,
    pub candidates: Vec<RepoCandidate>,
}

#[derive(Debug, Clone)]
pub enum Request {
    ArchiveGet(ArchiveGetParams),
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum Response {
    Result { actual_idx: Option<u32>, warnings: Vec<String> },
    Error(ArchiveError),
}

pub fn encode_request(req: &Request) -> Vec<u8> {
    let mut w = PackWriter::new();
    match req {
        Request::Shutdown => {
            w.write_string(1, "shutdown").expect("encodes");
        }
        Request::ArchiveGet(params) => {
            w.write_string(1, "archive-get").expect("encodes");
            w.write_string(2, &params.segment_name).expect("encodes");
            let mut id = 3u32;
            for c in &params.candidates {
                w.write_string(id, &c.repo_path.to_string_lossy()).expect("encodes");
                w.write_u32(id + 1, c.repo_index).expect("encodes");
                w.write_string(id + 2, &c.archive_id).expect("encodes");
                w.write_u32(id + 3, c.cipher_type.to_wire()).expect("encodes");
                w.write_string_opt(id + 4, c.cipher_pass.as_deref()).expect("encodes");
                id += 5;
            }
        }
    }
    w.into_bytes()
}

pub fn decode_request(bytes: &[u8]) -> Result<Request, ArchiveError> {
    let mut r = PackReader::new(bytes);
    let command = r.read_string(1, None)?.ok_or_else(|| ArchiveError::protocol("request missing command field"))?;
    if command == "shutdown" {
        return Ok(Request::Shutdown);
    }
    let segment_name = r
        .read_string(2, None)?
        .ok_or_else(|| ArchiveError::protocol("archive-get request missing segment name"))?;
    let mut candidates = Vec::new();
    let mut i = 0u32;
    loop {
        let base = 3 + 5 * i;
        let repo_path = match r.read_string(base, None)? {
            Some(p) => p,
            None => break,
        };
        let repo_index = r.read_u32(base + 1, 0)?;
        let archive_id = r.read_string(base + 2, None)?.unwrap_or_default();
        let cipher_type = CipherType::from_wire(r.read_u32(base + 3, 0)?).map_err(|e| ArchiveError::protocol(e.to_string()))?;
        let cipher_pass = r.read_string(base + 4, None)?;
        candidates.push(RepoCandidate {
            repo_index,
            repo_path: repo_path.into(),
            archive_id,
            cipher_type,
            cipher_pass,
        });
        i += 1;
    }
    Ok(Request::ArchiveGet(ArchiveGetParams { segment_name, candidates }))
}

pub fn encode_response(resp: &Response) -> Vec<u8> {
    let mut w = PackWriter::new();
    match resp {
        Response::Result { actual_idx, warnings } => {
            w.write_u32(1, actual_idx.unwrap_or(NOT_FOUND_SENTINEL)).expect("encodes");
            w.write_string_array(2, warnings).expect("encodes");
        }
        Response::Error(err) => {
            err.write_pack(&mut w).expect("encodes");
        }
    }
    w.into_bytes()
}

/// Peeks field 1's type to decide the response shape before committing to a
/// decode path (§4.A: `next()` used by "the child protocol dispatcher to
/// decide message kind (result vs error)"): a `u32` there means a normal
/// result, an `i32` means an error.
pub fn decode_response(bytes: &[u8]) -> Result<Response, ArchiveError> {
    let mut r = PackReader::new(bytes);
    match r.next()? {
        Some((1, PackType::U32)) => {
            let idx = r.read_u32(1, NOT_FOUND_SENTINEL)?;
            let warnings = r.read_string_array(2)?;
            Ok(Response::Result {
                actual_idx: if idx == NOT_FOUND_SENTINEL { None } else { Some(idx) },
                warnings,
            })
        }
        Some((1, PackType::I32)) => Ok(Response::Error(ArchiveError::read_pack(&mut r)?)),
        other => Err(ArchiveError::protocol(format!("unrecognized response shape at field 1: {other:?}"))),
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Returns `Ok(None)` on a clean EOF before any frame header bytes arrive
/// (the child closed its stdout — end of protocol, not an error).
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_get_request_round_trips_with_two_candidates() {
        let params = ArchiveGetParams {
            segment_name: "000000010000000000000005".to_string(),
            candidates: vec![
                RepoCandidate {
                    repo_index: 0,
                    repo_path: "/repo0".into(),
                    archive_id: "10-1".to_string(),
                    cipher_type: CipherType::None,
                    cipher_pass: None,
                },
                RepoCandidate {
                    repo_index: 1,
                    repo_path: "/repo1".into(),
                    archive_id: "11-1".to_string(),
                    cipher_type: CipherType::Aes256Cbc,
                    cipher_pass: Some("hunter2".to_string()),
                },
            ],
        };
        let bytes = encode_request(&Request::ArchiveGet(params));
        match decode_request(&bytes).unwrap() {
            Request::ArchiveGet(decoded) => {
                assert_eq!(decoded.segment_name, "000000010000000000000005");
                assert_eq!(decoded.candidates.len(), 2);
                assert_eq!(decoded.candidates[1].cipher_pass.as_deref(), Some("hunter2"));
            }
            Request::Shutdown => panic!("expected ArchiveGet"),
        }
    }

    #[test]
    fn shutdown_round_trips() {
        let bytes = encode_request(&Request::Shutdown);
        assert!(matches!(decode_request(&bytes).unwrap(), Request::Shutdown));
    }

    #[test]
    fn result_and_error_responses_are_distinguished_by_peek() {
        let ok = encode_response(&Response::Result { actual_idx: Some(1), warnings: vec!["w".to_string()] });
        match decode_response(&ok).unwrap() {
            Response::Result { actual_idx, warnings } => {
                assert_eq!(actual_idx, Some(1));
                assert_eq!(warnings, vec!["w".to_string()]);
            }
            Response::Error(_) => panic!("expected Result"),
        }

        let not_found = encode_response(&Response::Result { actual_idx: None, warnings: vec![] });
        match decode_response(&not_found).unwrap() {
            Response::Result { actual_idx, .. } => assert_eq!(actual_idx, None),
            Response::Error(_) => panic!("expected Result"),
        }

        let err = encode_response(&Response::Error(ArchiveError::transient_io("disk full")));
        match decode_response(&err).unwrap() {
            Response::Error(e) => assert_eq!(e.message, "disk full"),
            Response::Result { .. } => panic!("expected Error"),
        }
    }

    #[tokio::test]
    async fn frame_round_trips_over_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let payload = encode_request(&Request::Shutdown);
        write_frame(&mut a, &payload).await.unwrap();
        let received = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(received, payload);
    }
}
