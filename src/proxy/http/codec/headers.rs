use anyhow::{Result, anyhow, bail, ensure};
use http::header::HeaderName;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct HeaderLine {
    pub name: String,
    pub value: String,
    lower_name: String,
}

impl HeaderLine {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name_string = name.into();
        let lower_name = name_string.to_ascii_lowercase();
        let value_string = value.into();
        Self {
            name: name_string,
            value: value_string,
            lower_name,
        }
    }

    pub fn lower_name(&self) -> &str {
        &self.lower_name
    }

    pub fn is(&self, name: &str) -> bool {
        self.lower_name.eq_ignore_ascii_case(name)
    }
}

/// Framing-relevant header values after validation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct FramingHeaders {
    pub content_length: Option<u64>,
    pub chunked: bool,
}

/// Ordered, case-insensitive header multimap. Values are kept exactly as received and repeated
/// names are never coalesced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct HeaderSet {
    lines: Vec<HeaderLine>,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.lines.push(HeaderLine::new(name, value));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.lines
            .iter()
            .find(|line| line.is(name))
            .map(|line| line.value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.lines
            .iter()
            .filter(move |line| line.is(name))
            .map(|line| line.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lines.iter().any(|line| line.is(name))
    }

    pub fn remove_all(&mut self, name: &str) -> usize {
        let before = self.lines.len();
        self.lines.retain(|line| !line.is(name));
        before - self.lines.len()
    }

    /// Replaces every value of `name` with a single value, keeping the position of the first
    /// occurrence when there was one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let line = HeaderLine::new(name, value);
        match self.lines.iter().position(|existing| existing.is(&line.name)) {
            Some(idx) => {
                let lower = line.lower_name.clone();
                self.lines[idx] = line;
                let mut seen_first = false;
                self.lines.retain(|existing| {
                    if existing.lower_name != lower {
                        return true;
                    }
                    if seen_first {
                        return false;
                    }
                    seen_first = true;
                    true
                });
            }
            None => self.lines.push(line),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderLine> {
        self.lines.iter()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        for line in &self.lines {
            buf.extend_from_slice(line.name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(line.value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
    }

    /// Lower-cased tokens listed by every `Connection` header.
    pub fn connection_tokens(&self) -> Vec<String> {
        self.get_all("connection")
            .flat_map(|value| value.split(','))
            .map(|token| token.trim().to_ascii_lowercase())
            .filter(|token| !token.is_empty())
            .collect()
    }

    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|value| value.split(','))
            .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
    }

    /// Checks the message-framing headers: at most one `Content-Length`, never combined with
    /// `Transfer-Encoding`, and `chunked` as the only supported transfer coding.
    pub fn validate_framing(&self) -> Result<FramingHeaders> {
        let mut content_length = None;
        for value in self.get_all("content-length") {
            ensure!(
                content_length.is_none(),
                "multiple Content-Length headers are not allowed"
            );
            let trimmed = value.trim();
            ensure!(
                !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()),
                "invalid Content-Length value '{}'",
                value
            );
            let parsed = trimmed
                .parse::<u64>()
                .map_err(|_| anyhow!("invalid Content-Length value '{}'", value))?;
            content_length = Some(parsed);
        }

        let mut chunked = false;
        for value in self.get_all("transfer-encoding") {
            for coding in value.split(',').map(str::trim).filter(|c| !c.is_empty()) {
                if chunked {
                    bail!("chunked must be the final and only transfer coding");
                }
                if !coding.eq_ignore_ascii_case("chunked") {
                    bail!("unsupported Transfer-Encoding '{}'", coding);
                }
                chunked = true;
            }
        }
        if self.contains("transfer-encoding") {
            ensure!(chunked, "empty Transfer-Encoding header");
            ensure!(
                content_length.is_none(),
                "Content-Length and Transfer-Encoding must not both be present"
            );
        }

        Ok(FramingHeaders {
            content_length,
            chunked,
        })
    }
}

/// Incrementally parses header lines into a [`HeaderSet`] while enforcing a byte budget.
pub(crate) struct HeaderParser {
    headers: HeaderSet,
    total_bytes: usize,
    max_bytes: usize,
}

impl HeaderParser {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            headers: HeaderSet::new(),
            total_bytes: 0,
            max_bytes,
        }
    }

    /// Consumes one raw line including its line ending. Returns `Ok(false)` on the blank line that
    /// terminates the header block.
    pub fn push_line(&mut self, line: &str) -> Result<bool> {
        self.total_bytes = self
            .total_bytes
            .checked_add(line.len())
            .ok_or_else(|| anyhow!("header size overflow"))?;
        if self.total_bytes > self.max_bytes {
            bail!("headers exceed configured limit of {} bytes", self.max_bytes);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Ok(false);
        }
        if trimmed.starts_with([' ', '\t']) {
            bail!("obsolete header line folding is not supported");
        }

        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator"))?;
        if name.is_empty() {
            bail!("header name must not be empty");
        }
        if name.ends_with([' ', '\t']) {
            bail!("whitespace between header name '{}' and colon", name.trim_end());
        }
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| anyhow!("invalid header name '{name}'"))?;
        let value = value.trim_matches([' ', '\t']);
        self.headers.append(name, value);
        Ok(true)
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn finish(self) -> HeaderSet {
        self.headers
    }
}
