use crate::error::{LlmError, Result};
use bytes::Bytes;
use futures_util::Stream;
use futures_util::StreamExt;

/// One server-sent event frame. `event` defaults to "message" when the frame names none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: String,
    pub data: String,
}

pub(crate) fn decode_sse<S>(bytes_stream: S) -> impl Stream<Item = Result<SseFrame>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    futures_util::stream::unfold(
        (bytes_stream, String::new(), Vec::new()),
        |(mut stream, mut buffer, mut pending)| async move {
            loop {
                if let Some(frame) = take_frame(&mut buffer) {
                    match frame {
                        Some(frame) => return Some((Ok(frame), (stream, buffer, pending))),
                        None => continue,
                    }
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        pending.extend_from_slice(&chunk);
                        push_complete_utf8(&mut buffer, &mut pending);
                        continue;
                    }
                    Some(Err(e)) => {
                        return Some((
                            Err(LlmError::Http(e.to_string())),
                            (stream, buffer, pending),
                        ));
                    }
                    None => return None,
                }
            }
        },
    )
}

/// Moves the decodable prefix of `pending` into `buffer`. A code point split across
/// chunks stays in `pending` until its remaining bytes arrive.
fn push_complete_utf8(buffer: &mut String, pending: &mut Vec<u8>) {
    let valid = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => pending.len(),
    };
    let bytes: Vec<u8> = pending.drain(..valid).collect();
    buffer.push_str(&String::from_utf8_lossy(&bytes));
    if buffer.contains('\r') {
        *buffer = buffer.replace("\r\n", "\n");
    }
}

/// Pops one raw frame off the buffer. Outer `None`: need more bytes. Inner `None`: the
/// frame carried neither an event name nor data (comments, keep-alives).
fn take_frame(buffer: &mut String) -> Option<Option<SseFrame>> {
    let idx = buffer.find("\n\n")?;
    let raw = buffer[..idx].to_string();
    buffer.replace_range(..idx + 2, "");

    let mut event = String::new();
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("event:") {
            event = rest.trim_start().to_string();
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
    }

    let data = data_lines.join("\n");
    if event.is_empty() && data.is_empty() {
        return Some(None);
    }
    if event.is_empty() {
        event = "message".to_string();
    }
    Some(Some(SseFrame { event, data }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_split_on_blank_lines() {
        let mut buffer =
            "event: thread.run.created\ndata: {\"id\":\"run_1\"}\n\n: keep-alive\n\ndata: [DONE]\n\npartial"
                .to_string();

        let first = take_frame(&mut buffer).expect("complete frame").expect("frame");
        assert_eq!(first.event, "thread.run.created");
        assert_eq!(first.data, "{\"id\":\"run_1\"}");

        assert_eq!(take_frame(&mut buffer), Some(None), "comment frame is skipped");

        let done = take_frame(&mut buffer).expect("complete frame").expect("frame");
        assert_eq!(done.event, "message");
        assert_eq!(done.data, "[DONE]");

        assert_eq!(take_frame(&mut buffer), None);
        assert_eq!(buffer, "partial");
    }

    #[tokio::test]
    async fn characters_split_across_chunks_survive() {
        let body = "data: caf\u{e9}\r\n\r\n".as_bytes();
        let split = body.iter().position(|b| *b == 0xc3).expect("lead byte") + 1;
        let chunks: Vec<std::result::Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::copy_from_slice(&body[..split])),
            Ok(Bytes::copy_from_slice(&body[split..body.len() - 1])),
            Ok(Bytes::copy_from_slice(&body[body.len() - 1..])),
        ];

        let frames: Vec<Result<SseFrame>> =
            decode_sse(futures_util::stream::iter(chunks)).collect().await;
        assert_eq!(frames.len(), 1);
        let frame = frames.into_iter().next().expect("one frame").expect("decoded");
        assert_eq!(frame.data, "caf\u{e9}");
    }
}
