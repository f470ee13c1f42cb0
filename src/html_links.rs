use std::cell::RefCell;
use std::collections::BTreeSet;
use std::io::Read;

use html5ever::tendril::stream::TendrilSink;
use html5ever::tendril::StrTendril;
use html5ever::tokenizer::{
	BufferQueue, Tag, TagKind, Token, TokenSink, TokenSinkResult, Tokenizer, TokenizerOpts,
};
use url::Url;

use crate::apex::apex;

/// Root-page bodies are never tokenized past this many bytes.
pub const MAX_BODY_BYTES: usize = 512 * 1024;

struct LinkCollector {
	base: Url,
	base_apex: String,
	found: RefCell<BTreeSet<String>>,
	order: RefCell<Vec<String>>,
}

fn href_attr_for(tag_name: &str) -> Option<&'static str> {
	match tag_name {
		"a" | "link" => Some("href"),
		"script" | "img" | "iframe" | "source" => Some("src"),
		_ => None,
	}
}

impl LinkCollector {
	fn record(&self, raw_url: &str) {
		let Ok(resolved) = self.base.join(raw_url) else {
			return;
		};
		let Some(host) = resolved.host_str() else {
			return;
		};
		let host = host.to_ascii_lowercase();
		if apex(&host) != self.base_apex && self.found.borrow_mut().insert(host.clone()) {
			self.order.borrow_mut().push(host);
		}
	}
}

impl TokenSink for &LinkCollector {
	type Handle = ();

	fn process_token(&self, token: Token, _line_number: u64) -> TokenSinkResult<Self::Handle> {
		if let Token::TagToken(Tag {
			kind: TagKind::StartTag,
			name,
			attrs,
			..
		}) = token
		{
			if let Some(attr_name) = href_attr_for(&name) {
				for attr in &attrs {
					if attr.name.local.as_ref() == attr_name {
						self.record(attr.value.as_ref());
					}
				}
			}
		}
		TokenSinkResult::Continue
	}
}

/// Extracts the unique external hostnames linked/sourced from a root page's
/// HTML body, in document order. `body_reader` MUST already be size-capped
/// by the caller (see `MAX_BODY_BYTES`).
pub fn external_domains(base_host: &str, mut body_reader: impl Read) -> Vec<String> {
	let base = match Url::parse(&format!("https://{base_host}/")) {
		Ok(u) => u,
		Err(_) => return Vec::new(),
	};
	let base_apex = apex(base_host);

	let collector = LinkCollector {
		base,
		base_apex,
		found: RefCell::new(BTreeSet::new()),
		order: RefCell::new(Vec::new()),
	};

	let mut tokenizer = Tokenizer::new(&collector, TokenizerOpts::default());
	let mut buffer = BufferQueue::default();

	let mut raw = Vec::new();
	if body_reader.read_to_end(&mut raw).is_err() {
		return Vec::new();
	}
	let text = String::from_utf8_lossy(&raw);
	let tendril: StrTendril = text.as_ref().into();
	buffer.push_back(tendril);

	let _ = tokenizer.feed(&mut buffer);
	tokenizer.end();

	collector.order.into_inner()
}

/// Wraps a reader so at most `MAX_BODY_BYTES` are ever read from it,
/// matching the caller-side size cap the tokenizer relies on.
pub struct CappedReader<R> {
	inner: R,
	remaining: usize,
}

impl<R: Read> CappedReader<R> {
	pub fn new(inner: R) -> Self {
		Self {
			inner,
			remaining: MAX_BODY_BYTES,
		}
	}
}

impl<R: Read> Read for CappedReader<R> {
	fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
		if self.remaining == 0 {
			return Ok(0);
		}
		let cap = buf.len().min(self.remaining);
		let n = self.inner.read(&mut buf[..cap])?;
		self.remaining -= n;
		Ok(n)
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use std::io::Cursor;

	#[test]
	fn extracts_external_links_in_document_order() {
		let html = r#"
			<html><body>
				<a href="https://other.example/page">x</a>
				<link rel="stylesheet" href="https://cdn.example.net/app.css">
				<img src="/local.png">
				<script src="https://other.example/app.js"></script>
			</body></html>
		"#;
		let hosts = external_domains("example.com", Cursor::new(html));
		assert_eq!(hosts, vec!["other.example", "cdn.example.net"]);
	}

	#[test]
	fn skips_same_apex_links() {
		let html = r#"<a href="https://www.example.com/about">about</a>"#;
		let hosts = external_domains("example.com", Cursor::new(html));
		assert!(hosts.is_empty());
	}

	#[test]
	fn skips_malformed_urls_silently() {
		let html = r#"<a href="not a ://valid url">x</a><a href="https://good.example/">y</a>"#;
		let hosts = external_domains("example.com", Cursor::new(html));
		assert_eq!(hosts, vec!["good.example"]);
	}

	#[test]
	fn capped_reader_stops_at_limit() {
		let data = vec![b'a'; MAX_BODY_BYTES + 100];
		let mut capped = CappedReader::new(Cursor::new(data));
		let mut out = Vec::new();
		capped.read_to_end(&mut out).unwrap();
		assert_eq!(out.len(), MAX_BODY_BYTES);
	}
}
