use std::io::Cursor;

/// Convert HTML to readable plain text.
///
/// Notes:
/// - This is intentionally "good enough" and deterministic, not a full readability engine.
/// - Callers should apply their own output bounds (chars) if needed.
pub fn html_to_text(html: &str, width: usize) -> String {
    // html2text expects bytes; Cursor avoids allocating a second large buffer.
    html2text::from_read(Cursor::new(html.as_bytes()), width).unwrap_or_else(|_| html.to_string())
}

fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn has_any_text(s: &str) -> bool {
    s.chars().any(|c| !c.is_whitespace())
}

/// Extract text from a PDF body (in-memory bytes).
///
/// Notes:
/// - Callers should apply their own output bounds (chars) if needed.
/// - Extraction quality varies by PDF (text layer vs scanned images).
pub fn pdf_to_text(bytes: &[u8]) -> Result<String, String> {
    // `pdf-extract` is pure-Rust and works from memory; keep errors as strings
    // so callers can surface them as warnings without adding new error enums.
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| e.to_string())
}

/// Best-effort sniff for PDF bytes (magic header).
pub fn bytes_look_like_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(b"%PDF-")
}

/// Best-effort guess for whether bytes are HTML-ish.
pub fn bytes_look_like_html(bytes: &[u8]) -> bool {
    // Skip leading whitespace.
    let mut i = 0usize;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    if i >= bytes.len() {
        return false;
    }
    let rest = &bytes[i..];
    // Common prefixes; keep it conservative.
    rest.starts_with(b"<!doctype")
        || rest.starts_with(b"<!DOCTYPE")
        || rest.starts_with(b"<html")
        || rest.starts_with(b"<HTML")
        || rest.starts_with(b"<head")
        || rest.starts_with(b"<body")
}

/// Best-effort sniff for common image formats.
pub fn bytes_look_like_image(bytes: &[u8]) -> bool {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        return true;
    }
    if bytes.starts_with(b"\xff\xd8\xff") {
        return true;
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return true;
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return true;
    }
    false
}

fn class_or_id_lc(el: &html_scraper::ElementRef) -> String {
    let mut out = String::new();
    if let Some(c) = el.value().attr("class") {
        out.push_str(c);
        out.push(' ');
    }
    if let Some(i) = el.value().attr("id") {
        out.push_str(i);
    }
    out.to_ascii_lowercase()
}

fn is_generic_boilerplate_container(el: &html_scraper::ElementRef) -> bool {
    // Keep this generic: avoid site/host heuristics; only structural UI words.
    let s = class_or_id_lc(el);
    if s.is_empty() {
        return false;
    }
    for bad in [
        "nav",
        "navbar",
        "menu",
        "sidebar",
        "footer",
        "header",
        "banner",
        "cookie",
        "consent",
        "ads",
        "advert",
        "promo",
        "subscribe",
        "newsletter",
    ] {
        if s.contains(bad) {
            return true;
        }
    }
    false
}

fn element_text_chars(el: &html_scraper::ElementRef) -> usize {
    el.text().map(|t| t.chars().count()).sum()
}

fn element_link_text_chars(el: &html_scraper::ElementRef) -> usize {
    let sel = html_scraper::Selector::parse("a").ok();
    let Some(sel) = sel else { return 0 };
    el.select(&sel)
        .map(|a| a.text().map(|t| t.chars().count()).sum::<usize>())
        .sum()
}

fn pick_main_text(html: &str, max_elems: usize) -> Option<String> {
    let max_elems = max_elems.clamp(50, 50_000);
    let doc = html_scraper::Html::parse_document(html);

    let sel = html_scraper::Selector::parse("article, main, section, div").ok()?;
    let mut seen = 0usize;
    let mut best_score: i64 = 0;
    let mut best_text: Option<String> = None;

    for el in doc.select(&sel) {
        seen += 1;
        if seen > max_elems {
            break;
        }
        if is_generic_boilerplate_container(&el) {
            continue;
        }
        let txt = element_text_chars(&el);
        // Keep this low enough to work for small single-article pages; tag
        // bonuses and link-density penalties handle nav widgets.
        if txt < 20 {
            continue;
        }
        let link_txt = element_link_text_chars(&el);
        // Prefer dense non-link text. Link text is usually navigation / TOCs / tag clouds.
        let mut score = txt as i64 - 2 * (link_txt as i64);
        let tag = el.value().name();
        if tag == "article" {
            score += 500;
        } else if tag == "main" {
            score += 300;
        }
        // Penalize suspiciously link-heavy blocks.
        if link_txt > txt / 2 {
            score -= 500;
        }
        if score > best_score {
            best_score = score;
            let t = el.text().collect::<Vec<_>>().join(" ");
            best_text = Some(norm_ws(&t));
        }
    }

    best_text
}

pub fn html_main_to_text(html: &str) -> Option<String> {
    let out = pick_main_text(html, 20_000)?;
    has_any_text(&out).then_some(out)
}

#[derive(Debug, Clone)]
pub struct ExtractedText {
    pub engine: &'static str,
    pub text: String,
    pub warnings: Vec<&'static str>,
}

fn content_type_lc_prefix(ct: Option<&str>) -> String {
    ct.unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

fn strip_tag_blocks(html: &str, tag: &str) -> String {
    // Minimal, best-effort stripper for <tag ...> ... </tag> blocks.
    //
    // This is intentionally conservative: it only removes when it finds a close tag,
    // and it is ASCII-case-insensitive on tag names.
    let tag_lc = tag.to_ascii_lowercase();
    let open_pat = format!("<{}", tag_lc);
    let close_pat = format!("</{}>", tag_lc);

    let mut out = String::new();
    let mut i = 0usize;
    let lower = html.to_ascii_lowercase();
    while let Some(rel_start) = lower[i..].find(&open_pat) {
        let start = i + rel_start;
        // Find the matching close tag after start.
        let after_open = start + open_pat.len();
        if let Some(rel_end) = lower[after_open..].find(&close_pat) {
            let end = after_open + rel_end + close_pat.len();
            out.push_str(&html[i..start]);
            i = end;
        } else {
            // No close tag; stop stripping.
            break;
        }
    }
    out.push_str(&html[i..]);
    out
}

/// Extract best-effort readable text from a fetched body.
///
/// The goal is "good enough" evidence text for downstream chunking/embedding:
/// - HTML: main-content extraction when it clearly wins, else whole-page html2text.
/// - PDF: pdf-extract.
/// - Markdown/text/json/xml: treat as text (no HTML rendering).
/// - Unknown/binary: empty text + warning.
pub fn best_effort_text_from_bytes(
    bytes: &[u8],
    content_type: Option<&str>,
    width: usize,
) -> ExtractedText {
    let mut warnings: Vec<&'static str> = Vec::new();

    let ct0 = content_type_lc_prefix(content_type);
    let is_pdf = ct0 == "application/pdf" || bytes_look_like_pdf(bytes);
    if is_pdf {
        return match pdf_to_text(bytes) {
            Ok(t) => ExtractedText {
                engine: "pdf-extract",
                text: t,
                warnings,
            },
            Err(_) => {
                warnings.push("pdf_extract_failed");
                ExtractedText {
                    engine: "pdf-extract",
                    text: String::new(),
                    warnings,
                }
            }
        };
    }

    // Images carry no extractable text here; return supported-but-empty so
    // callers get a stable engine + warning.
    if ct0.starts_with("image/") || bytes_look_like_image(bytes) {
        warnings.push("image_no_text_extraction");
        return ExtractedText {
            engine: "image",
            text: String::new(),
            warnings,
        };
    }

    // Treat common text-like content types as plain text. This avoids trying to render
    // JSON/markdown/xml through html2text, which usually produces noisy output.
    let is_markdown = ct0 == "text/markdown" || ct0 == "text/x-markdown";
    let is_json = ct0 == "application/json" || ct0.ends_with("+json");
    let is_xml = ct0 == "application/xml" || ct0 == "text/xml" || ct0.ends_with("+xml");
    let is_text = ct0.starts_with("text/") || is_markdown || is_json || is_xml;
    if is_text && !bytes_look_like_html(bytes) {
        let text = String::from_utf8_lossy(bytes).to_string();
        let engine = if is_markdown {
            "markdown"
        } else if is_json {
            "json"
        } else if is_xml {
            "xml"
        } else {
            "text"
        };
        return ExtractedText {
            engine,
            text,
            warnings,
        };
    }

    // Default: HTML-ish (or unknown-but-seems-text). Prefer a main-content extraction when
    // it clearly improves signal; otherwise fall back to whole-page html2text.
    let html0 = String::from_utf8_lossy(bytes).to_string();
    // Strip script/style/noscript blocks before html2text to avoid counting JS/CSS as content.
    // This keeps script-only pages as empty (so higher-level fallbacks can trigger).
    let html1 = strip_tag_blocks(&html0, "script");
    let html2 = strip_tag_blocks(&html1, "style");
    let html = strip_tag_blocks(&html2, "noscript");
    let full = html_to_text(&html, width);
    let main = html_main_to_text(&html);

    fn quality_score(s: &str) -> i64 {
        let non_ws = s.chars().filter(|c| !c.is_whitespace()).count() as i64;
        let url_hits = s.matches("http").count() as i64;
        // Penalize link soup.
        let mut score = non_ws - 200 * url_hits;

        // Penalize pages dominated by many short lines (common for nav/menus).
        let short_lines = s
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .filter(|l| l.chars().count() <= 30)
            .count() as i64;
        score -= 20 * short_lines;

        // Penalize common UI boilerplate tokens (kept small + generic).
        let sl = s.to_ascii_lowercase();
        for needle in [
            "sign up", "log in", "login", "cookie", "consent", "privacy", "terms",
        ] {
            let hits = sl.matches(needle).count() as i64;
            score -= 250 * hits;
        }

        score
    }

    let full_ok = has_any_text(&full);
    let main_ok = main.as_ref().map(|t| has_any_text(t)).unwrap_or(false);
    if main_ok {
        let s_main = quality_score(main.as_ref().unwrap());
        let s_full = if full_ok { quality_score(&full) } else { 0 };
        // Prefer main-content when it is meaningfully better than whole-page text.
        if !full_ok || s_main >= s_full + 300 {
            warnings.push("boilerplate_reduced");
            return ExtractedText {
                engine: "html_main",
                text: main.unwrap(),
                warnings,
            };
        }
    }

    if full_ok {
        return ExtractedText {
            engine: "html2text",
            text: full,
            warnings,
        };
    }

    // If we still have nothing, treat as unsupported/binary.
    if !bytes.is_empty() {
        warnings.push("unsupported_content_no_text");
    }
    ExtractedText {
        engine: "unknown",
        text: String::new(),
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_text_from_simple_html() {
        let html = r#"<html><body><h1>Hello</h1><p>world</p></body></html>"#;
        let out = html_to_text(html, 80);
        assert!(out.contains("Hello"));
        assert!(out.contains("world"));
    }

    #[test]
    fn bytes_look_like_pdf_sniffs_magic_header() {
        assert!(bytes_look_like_pdf(b"%PDF-1.7\n%..."));
        assert!(!bytes_look_like_pdf(b"<!doctype html><html>"));
        assert!(!bytes_look_like_pdf(b""));
    }

    #[test]
    fn bytes_look_like_html_sniffs_common_prefixes() {
        assert!(bytes_look_like_html(b"<!doctype html><html>"));
        assert!(bytes_look_like_html(b"   <html><body>x</body></html>"));
        assert!(!bytes_look_like_html(br#"{"a":1}"#));
        assert!(!bytes_look_like_html(b""));
    }

    #[test]
    fn images_are_supported_but_empty() {
        // Minimal PNG header.
        let png = b"\x89PNG\r\n\x1a\n\x00\x00\x00\x0dIHDR";
        let ex = best_effort_text_from_bytes(png, Some("image/png"), 80);
        assert_eq!(ex.engine, "image");
        assert!(ex.text.is_empty());
        assert!(ex.warnings.contains(&"image_no_text_extraction"));
    }

    #[test]
    fn plain_text_passes_through_without_html_rendering() {
        let ex = best_effort_text_from_bytes(b"rabies is preventable", Some("text/plain"), 80);
        assert_eq!(ex.engine, "text");
        assert_eq!(ex.text, "rabies is preventable");
    }

    #[test]
    fn html_main_to_text_prefers_article_like_blocks() {
        let html = r#"
        <html><body>
          <nav class="nav"><a href="/x">Home</a></nav>
          <article><h1>Title</h1><p>Hello world.</p><p>More text here.</p></article>
          <footer class="footer"><a href="/y">Privacy</a></footer>
        </body></html>
        "#;
        let out = html_main_to_text(html).unwrap_or_default();
        assert!(out.to_lowercase().contains("hello"));
        assert!(out.to_lowercase().contains("more"));
        assert!(!out.to_lowercase().contains("privacy"));
    }

    #[test]
    fn script_only_pages_extract_as_empty() {
        let html = b"<html><head><script>var x = 1;</script></head><body></body></html>";
        let ex = best_effort_text_from_bytes(html, Some("text/html"), 80);
        assert!(ex.text.trim().is_empty(), "got text: {:?}", ex.text);
    }
}
