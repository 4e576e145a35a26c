//! Filename sanitizing for uploaded files.

const MAX_STEM_CHARS: usize = 100;
const MAX_EXTENSION_CHARS: usize = 16;
const FALLBACK_STEM: &str = "file";
const RESERVED_STEMS: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

/// A filesystem-safe basename split into stem and extension.
///
/// The extension is kept as sent (ASCII alphanumerics only) so type checks
/// downstream still see what the client declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedName {
    stem: String,
    extension: Option<String>,
}

impl SanitizedName {
    pub fn new(raw: &str) -> Self {
        let base = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();

        let (raw_stem, raw_extension) = match base.rsplit_once('.') {
            Some((stem, extension)) => (stem, Some(extension)),
            None => (base, None),
        };

        let extension = raw_extension
            .filter(|ext| {
                !ext.is_empty()
                    && ext.len() <= MAX_EXTENSION_CHARS
                    && ext.chars().all(|ch| ch.is_ascii_alphanumeric())
            })
            .map(str::to_string);

        // An extension that failed the checks stays part of the stem.
        let raw_stem = if extension.is_none() { base } else { raw_stem };

        Self {
            stem: sanitize_stem(raw_stem),
            extension,
        }
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    pub fn file_name(&self) -> String {
        self.with_suffix(0)
    }

    /// `name.ext` for 0, otherwise `name_N.ext`.
    pub fn with_suffix(&self, suffix: u32) -> String {
        let stem = if suffix == 0 {
            self.stem.clone()
        } else {
            format!("{}_{suffix}", self.stem)
        };
        match &self.extension {
            Some(extension) => format!("{stem}.{extension}"),
            None => stem,
        }
    }
}

fn sanitize_stem(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_separator = false;

    for ch in raw.chars() {
        let mapped = if ch.is_alphanumeric() || ch == '-' {
            ch
        } else {
            '_'
        };
        if mapped == '_' {
            if last_was_separator {
                continue;
            }
            last_was_separator = true;
        } else {
            last_was_separator = false;
        }
        out.push(mapped);
    }

    let trimmed: String = out
        .trim_matches(|ch| ch == '_' || ch == '-')
        .chars()
        .take(MAX_STEM_CHARS)
        .collect();
    let trimmed = trimmed.trim_end_matches(['_', '-']).to_string();

    if trimmed.is_empty() {
        return FALLBACK_STEM.to_string();
    }

    if RESERVED_STEMS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(&trimmed))
    {
        return format!("{trimmed}_");
    }

    trimmed
}
