/// Markdown documents in the vault carry their structured fields in a
/// leading `---` YAML block. The body after the closing fence is free
/// prose and is preserved verbatim.
pub fn split(raw: &str) -> Option<(&str, &str)> {
    let rest = raw.strip_prefix("---")?;
    let rest = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n"))?;
    let end = rest.find("\n---")?;
    let yaml = &rest[..end + 1];
    let after = &rest[end + 4..];
    let body = after.strip_prefix('\n').unwrap_or(after);
    Some((yaml, body))
}

pub fn render(yaml: &str, body: &str) -> String {
    let yaml = yaml.strip_prefix("---\n").unwrap_or(yaml);
    let yaml = yaml.trim_end_matches('\n');
    if body.is_empty() {
        format!("---\n{yaml}\n---\n")
    } else {
        format!("---\n{yaml}\n---\n{body}")
    }
}
