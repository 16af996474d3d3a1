//! Incremental JSON tokenizer.
//!
//! Responses are consumed as a sequence of [`JsonEvent`]s so that big result
//! sets never need to be buffered. Only the sub-trees a caller asks for
//! (a row key, a document...) are materialized as [`serde_json::Value`].

use crate::error::{Error, Result};
use crate::transport::BodyStream;
use futures_util::stream::{self, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize as _;
use serde_json::{Map, Number, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum JsonEvent {
    StartObject,
    EndObject,
    StartArray,
    EndArray,
    FieldName(String),
    String(String),
    Number(Number),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    Object,
    Array,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Value,
    FirstValueOrEnd,
    FirstKeyOrEnd,
    Key,
    Colon,
    CommaOrEnd,
    Trailing,
}

/// Push tokenizer: feed it chunks, pull events out.
///
/// `next_event` returns `Ok(None)` whenever the buffered bytes do not hold a
/// complete token; once [`Tokenizer::finish`] has been called a truncated
/// document is reported as an error instead.
#[derive(Debug)]
pub struct Tokenizer {
    buf: Vec<u8>,
    pos: usize,
    /// Offset from `pos` up to which an unfinished string or number has
    /// already been scanned, 0 when no token is pending.
    scan: usize,
    stack: Vec<Frame>,
    expect: Expect,
    eof: bool,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            scan: 0,
            stack: Vec::new(),
            expect: Expect::Value,
            eof: false,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        // compact once the consumed prefix outweighs what is left
        if self.pos > 0 && self.pos >= self.buf.len() - self.pos {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(chunk);
    }

    pub fn finish(&mut self) {
        self.eof = true;
    }

    /// True once a whole top-level value has been read.
    pub fn is_complete(&self) -> bool {
        self.expect == Expect::Trailing
    }

    pub fn next_event(&mut self) -> Result<Option<JsonEvent>> {
        loop {
            self.skip_whitespace();
            let Some(&byte) = self.buf.get(self.pos) else {
                return self.end_of_input();
            };
            match self.expect {
                Expect::FirstValueOrEnd if byte == b']' => {
                    self.pos += 1;
                    return Ok(Some(self.close(Frame::Array)));
                }
                Expect::Value | Expect::FirstValueOrEnd => return self.value(byte),
                Expect::FirstKeyOrEnd if byte == b'}' => {
                    self.pos += 1;
                    return Ok(Some(self.close(Frame::Object)));
                }
                Expect::FirstKeyOrEnd | Expect::Key => {
                    if byte != b'"' {
                        return Err(self.unexpected(byte, "field name"));
                    }
                    return Ok(self.string()?.map(|name| {
                        self.expect = Expect::Colon;
                        JsonEvent::FieldName(name)
                    }));
                }
                Expect::Colon => {
                    if byte != b':' {
                        return Err(self.unexpected(byte, "':'"));
                    }
                    self.pos += 1;
                    self.expect = Expect::Value;
                }
                Expect::CommaOrEnd => {
                    let frame = self.stack.last().copied();
                    self.pos += 1;
                    match (byte, frame) {
                        (b',', Some(Frame::Object)) => self.expect = Expect::Key,
                        (b',', Some(Frame::Array)) => self.expect = Expect::Value,
                        (b'}', Some(Frame::Object)) => return Ok(Some(self.close(Frame::Object))),
                        (b']', Some(Frame::Array)) => return Ok(Some(self.close(Frame::Array))),
                        _ => {
                            self.pos -= 1;
                            return Err(self.unexpected(byte, "',' or end of container"));
                        }
                    }
                }
                Expect::Trailing => return Err(self.unexpected(byte, "end of input")),
            }
        }
    }

    fn end_of_input(&self) -> Result<Option<JsonEvent>> {
        if self.eof && self.expect != Expect::Trailing {
            Err(Error::protocol("unexpected end of JSON input"))
        } else {
            Ok(None)
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(b' ' | b'\n' | b'\r' | b'\t') = self.buf.get(self.pos) {
            self.pos += 1;
        }
    }

    fn unexpected(&self, byte: u8, expected: &str) -> Error {
        Error::protocol(format!(
            "unexpected character '{}', expected {}",
            byte as char, expected
        ))
    }

    fn open(&mut self, frame: Frame) -> JsonEvent {
        self.pos += 1;
        self.stack.push(frame);
        match frame {
            Frame::Object => {
                self.expect = Expect::FirstKeyOrEnd;
                JsonEvent::StartObject
            }
            Frame::Array => {
                self.expect = Expect::FirstValueOrEnd;
                JsonEvent::StartArray
            }
        }
    }

    fn close(&mut self, frame: Frame) -> JsonEvent {
        self.stack.pop();
        self.after_value();
        match frame {
            Frame::Object => JsonEvent::EndObject,
            Frame::Array => JsonEvent::EndArray,
        }
    }

    fn after_value(&mut self) {
        self.expect = if self.stack.is_empty() {
            Expect::Trailing
        } else {
            Expect::CommaOrEnd
        };
    }

    fn value(&mut self, byte: u8) -> Result<Option<JsonEvent>> {
        let event = match byte {
            b'{' => Some(self.open(Frame::Object)),
            b'[' => Some(self.open(Frame::Array)),
            b'"' => self.string()?.map(JsonEvent::String),
            b'-' | b'0'..=b'9' => self.number()?.map(JsonEvent::Number),
            b't' => self.literal(b"true")?.map(|_| JsonEvent::Bool(true)),
            b'f' => self.literal(b"false")?.map(|_| JsonEvent::Bool(false)),
            b'n' => self.literal(b"null")?.map(|_| JsonEvent::Null),
            other => return Err(self.unexpected(other, "value")),
        };
        if matches!(
            event,
            Some(
                JsonEvent::String(_)
                    | JsonEvent::Number(_)
                    | JsonEvent::Bool(_)
                    | JsonEvent::Null
            )
        ) {
            self.after_value();
        }
        Ok(event)
    }

    fn string(&mut self) -> Result<Option<String>> {
        let mut end = self.pos + self.scan.max(1);
        while end < self.buf.len() {
            match self.buf[end] {
                b'\\' => end += 2,
                b'"' => {
                    let raw = &self.buf[self.pos..=end];
                    let decoded = serde_json::from_slice::<String>(raw)
                        .map_err(|e| Error::protocol(format!("invalid string: {}", e)))?;
                    self.pos = end + 1;
                    self.scan = 0;
                    return Ok(Some(decoded));
                }
                _ => end += 1,
            }
        }
        self.scan = end - self.pos;
        self.incomplete()
    }

    fn number(&mut self) -> Result<Option<Number>> {
        let mut end = self.pos + self.scan;
        while let Some(b'0'..=b'9' | b'-' | b'+' | b'.' | b'e' | b'E') = self.buf.get(end) {
            end += 1;
        }
        if end == self.buf.len() && !self.eof {
            self.scan = end - self.pos;
            return Ok(None);
        }
        self.scan = 0;
        let number = serde_json::from_slice::<Number>(&self.buf[self.pos..end])
            .map_err(|e| Error::protocol(format!("invalid number: {}", e)))?;
        self.pos = end;
        Ok(Some(number))
    }

    fn literal(&mut self, word: &'static [u8]) -> Result<Option<()>> {
        let available = &self.buf[self.pos..];
        let len = available.len().min(word.len());
        if available[..len] != word[..len] {
            return Err(self.unexpected(available[0], "literal"));
        }
        if len < word.len() {
            return self.incomplete();
        }
        self.pos += word.len();
        Ok(Some(()))
    }

    fn incomplete<T>(&self) -> Result<Option<T>> {
        if self.eof {
            Err(Error::protocol("unexpected end of JSON input"))
        } else {
            Ok(None)
        }
    }
}

/// Rebuilds a [`Value`] out of events.
#[derive(Debug, Default)]
pub struct ValueBuilder {
    stack: Vec<Partial>,
}

#[derive(Debug)]
enum Partial {
    Object(Map<String, Value>, Option<String>),
    Array(Vec<Value>),
}

impl ValueBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Returns the value once the event completes it.
    pub fn push(&mut self, event: JsonEvent) -> Result<Option<Value>> {
        let value = match event {
            JsonEvent::StartObject => {
                self.stack.push(Partial::Object(Map::new(), None));
                return Ok(None);
            }
            JsonEvent::StartArray => {
                self.stack.push(Partial::Array(Vec::new()));
                return Ok(None);
            }
            JsonEvent::FieldName(name) => match self.stack.last_mut() {
                Some(Partial::Object(_, pending)) => {
                    *pending = Some(name);
                    return Ok(None);
                }
                _ => return Err(Error::protocol("field name outside of an object")),
            },
            JsonEvent::EndObject => match self.stack.pop() {
                Some(Partial::Object(map, _)) => Value::Object(map),
                _ => return Err(Error::protocol("unbalanced end of object")),
            },
            JsonEvent::EndArray => match self.stack.pop() {
                Some(Partial::Array(values)) => Value::Array(values),
                _ => return Err(Error::protocol("unbalanced end of array")),
            },
            JsonEvent::String(s) => Value::String(s),
            JsonEvent::Number(n) => Value::Number(n),
            JsonEvent::Bool(b) => Value::Bool(b),
            JsonEvent::Null => Value::Null,
        };
        match self.stack.last_mut() {
            None => Ok(Some(value)),
            Some(Partial::Array(values)) => {
                values.push(value);
                Ok(None)
            }
            Some(Partial::Object(map, pending)) => {
                let name = pending
                    .take()
                    .ok_or_else(|| Error::protocol("object value without field name"))?;
                map.insert(name, value);
                Ok(None)
            }
        }
    }
}

/// Pull based token source over a response body.
///
/// Network chunks are only read when the tokenizer runs dry, so decoding
/// never gets ahead of the consumer.
pub struct JsonTokens {
    body: BodyStream,
    tokenizer: Tokenizer,
    peeked: Option<JsonEvent>,
}

impl JsonTokens {
    pub fn new(body: BodyStream) -> Self {
        Self {
            body,
            tokenizer: Tokenizer::new(),
            peeked: None,
        }
    }

    pub async fn next(&mut self) -> Result<Option<JsonEvent>> {
        if let Some(event) = self.peeked.take() {
            return Ok(Some(event));
        }
        loop {
            if let Some(event) = self.tokenizer.next_event()? {
                return Ok(Some(event));
            }
            if self.tokenizer.is_complete() {
                return Ok(None);
            }
            match self.body.next().await {
                Some(chunk) => self.tokenizer.feed(&chunk?),
                None => {
                    self.tokenizer.finish();
                    if let Some(event) = self.tokenizer.next_event()? {
                        return Ok(Some(event));
                    }
                    return Ok(None);
                }
            }
        }
    }

    pub async fn peek(&mut self) -> Result<Option<&JsonEvent>> {
        if self.peeked.is_none() {
            self.peeked = self.next().await?;
        }
        Ok(self.peeked.as_ref())
    }

    /// Next event, failing on end of input.
    pub async fn expect(&mut self) -> Result<JsonEvent> {
        self.next()
            .await?
            .ok_or_else(|| Error::protocol("unexpected end of JSON input"))
    }

    /// Consumes the next value without materializing it.
    pub async fn skip_value(&mut self) -> Result<()> {
        let mut depth = 0usize;
        loop {
            match self.expect().await? {
                JsonEvent::StartObject | JsonEvent::StartArray => depth += 1,
                JsonEvent::EndObject | JsonEvent::EndArray => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| Error::protocol("expected a value"))?;
                }
                JsonEvent::FieldName(_) => continue,
                _ => {}
            }
            if depth == 0 {
                return Ok(());
            }
        }
    }

    /// Materializes the next value. Returns `None` and consumes the closing
    /// token when the enclosing container ends instead.
    pub async fn next_value(&mut self) -> Result<Option<Value>> {
        let mut builder = ValueBuilder::new();
        match self.expect().await? {
            JsonEvent::EndArray | JsonEvent::EndObject => return Ok(None),
            first => {
                if let Some(value) = builder.push(first)? {
                    return Ok(Some(value));
                }
            }
        }
        loop {
            if let Some(value) = builder.push(self.expect().await?)? {
                return Ok(Some(value));
            }
        }
    }

    pub async fn next_string(&mut self) -> Result<String> {
        match self.expect().await? {
            JsonEvent::String(s) => Ok(s),
            other => Err(Error::protocol(format!("expected a string, found {:?}", other))),
        }
    }

    pub async fn next_number_or_null(&mut self) -> Result<Option<Number>> {
        match self.expect().await? {
            JsonEvent::Number(n) => Ok(Some(n)),
            JsonEvent::Null => Ok(None),
            other => Err(Error::protocol(format!("expected a number, found {:?}", other))),
        }
    }
}

/// Streams the elements of a top-level array, decoding each one as `T`.
pub(crate) fn typed_array<T>(tokens: JsonTokens) -> impl Stream<Item = Result<T>> + Send
where
    T: DeserializeOwned + Send + 'static,
{
    stream::try_unfold((tokens, false), |(mut tokens, started)| async move {
        if !started {
            match tokens.expect().await? {
                JsonEvent::StartArray => {}
                other => {
                    return Err(Error::protocol(format!(
                        "expected result to start with an array, found {:?}",
                        other
                    )))
                }
            }
        }
        let Some(value) = tokens.next_value().await? else {
            return Ok(None);
        };
        let item = T::deserialize(&value).map_err(|error| Error::ParsingFailed {
            error,
            json: value.to_string(),
        })?;
        Ok(Some((item, (tokens, true))))
    })
}

/// Tokenizes a complete in-memory document.
pub fn events(bytes: &[u8]) -> Result<Vec<JsonEvent>> {
    let mut tokenizer = Tokenizer::new();
    tokenizer.feed(bytes);
    tokenizer.finish();
    let mut events = Vec::new();
    while let Some(event) = tokenizer.next_event()? {
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::stream;
    use serde_json::json;

    fn body(chunks: Vec<&'static str>) -> BodyStream {
        Box::pin(stream::iter(
            chunks.into_iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))),
        ))
    }

    #[test]
    fn tokenizes_nested_document() {
        let events = events(br#"{"a": [1, -2.5e3, true, null], "b": {"c": "d\"e"}}"#).unwrap();
        assert_eq!(
            events,
            vec![
                JsonEvent::StartObject,
                JsonEvent::FieldName("a".into()),
                JsonEvent::StartArray,
                JsonEvent::Number(1.into()),
                JsonEvent::Number(Number::from_f64(-2500.0).unwrap()),
                JsonEvent::Bool(true),
                JsonEvent::Null,
                JsonEvent::EndArray,
                JsonEvent::FieldName("b".into()),
                JsonEvent::StartObject,
                JsonEvent::FieldName("c".into()),
                JsonEvent::String("d\"e".into()),
                JsonEvent::EndObject,
                JsonEvent::EndObject,
            ]
        );
    }

    #[test]
    fn waits_for_tokens_split_across_chunks() {
        let mut tokenizer = Tokenizer::new();
        tokenizer.feed(br#"{"na"#);
        assert_eq!(tokenizer.next_event().unwrap(), Some(JsonEvent::StartObject));
        assert_eq!(tokenizer.next_event().unwrap(), None);
        tokenizer.feed(br#"me": 12"#);
        assert_eq!(
            tokenizer.next_event().unwrap(),
            Some(JsonEvent::FieldName("name".into()))
        );
        // the number may continue in the next chunk
        assert_eq!(tokenizer.next_event().unwrap(), None);
        tokenizer.feed(b"3, \"ok\": tr");
        assert_eq!(tokenizer.next_event().unwrap(), Some(JsonEvent::Number(123.into())));
        assert_eq!(
            tokenizer.next_event().unwrap(),
            Some(JsonEvent::FieldName("ok".into()))
        );
        assert_eq!(tokenizer.next_event().unwrap(), None);
        tokenizer.feed(b"ue}");
        assert_eq!(tokenizer.next_event().unwrap(), Some(JsonEvent::Bool(true)));
        assert_eq!(tokenizer.next_event().unwrap(), Some(JsonEvent::EndObject));
        assert!(tokenizer.is_complete());
    }

    #[test]
    fn long_string_fed_byte_by_byte() {
        let mut content = String::new();
        while content.len() < 256 * 1024 {
            content.push_str("abc\\\"\\u00e9xyz");
        }
        let document = format!("[\"{}\", 12345]", content);
        let mut tokenizer = Tokenizer::new();
        let mut events = Vec::new();
        for byte in document.as_bytes() {
            tokenizer.feed(std::slice::from_ref(byte));
            while let Some(event) = tokenizer.next_event().unwrap() {
                events.push(event);
            }
        }
        tokenizer.finish();
        assert_eq!(tokenizer.next_event().unwrap(), None);
        let expected: String = serde_json::from_str(&format!("\"{}\"", content)).unwrap();
        assert_eq!(
            events,
            vec![
                JsonEvent::StartArray,
                JsonEvent::String(expected),
                JsonEvent::Number(12345.into()),
                JsonEvent::EndArray,
            ]
        );
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(events(b"{\"a\" 1}").is_err());
        assert!(events(b"[1 2]").is_err());
        assert!(events(b"{\"a\": 1").is_err());
        assert!(events(b"[1] [2]").is_err());
        assert!(events(b"nul").is_err());
    }

    #[test]
    fn empty_containers() {
        assert_eq!(
            events(b"{\"a\":{},\"b\":[]}").unwrap(),
            vec![
                JsonEvent::StartObject,
                JsonEvent::FieldName("a".into()),
                JsonEvent::StartObject,
                JsonEvent::EndObject,
                JsonEvent::FieldName("b".into()),
                JsonEvent::StartArray,
                JsonEvent::EndArray,
                JsonEvent::EndObject,
            ]
        );
    }

    #[tokio::test]
    async fn materializes_sub_trees() {
        let mut tokens = JsonTokens::new(body(vec![
            "[{\"id\":\"a\",\"n\":[1,",
            "2]},\"x\",",
            "{\"skip\":{\"deep\":[{}]}}]",
        ]));
        assert_eq!(tokens.expect().await.unwrap(), JsonEvent::StartArray);
        assert_eq!(
            tokens.next_value().await.unwrap(),
            Some(json!({"id": "a", "n": [1, 2]}))
        );
        assert_eq!(tokens.next_value().await.unwrap(), Some(json!("x")));
        tokens.skip_value().await.unwrap();
        assert_eq!(tokens.next_value().await.unwrap(), None);
        assert_eq!(tokens.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let mut tokens = JsonTokens::new(body(vec!["{\"rows\": ["]));
        assert_eq!(tokens.expect().await.unwrap(), JsonEvent::StartObject);
        tokens.expect().await.unwrap();
        tokens.expect().await.unwrap();
        assert!(tokens.next().await.is_err());
    }
}
