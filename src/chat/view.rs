//! Chat-Verlauf

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Hinweis nach dem Leeren des Verlaufs
pub const CLEARED_NOTICE: &str = "Chat history cleared";

const EXPORT_PREFIX: &str = "metal52-chat";

// ============================================================================
// ENTRIES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EntryKind {
    Message { sender: String },
    System,
}

/// Ein Eintrag im Verlauf
///
/// Ohne Zeitstempel wird `[SYSTEM]` angezeigt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatEntry {
    pub kind: EntryKind,
    pub text: String,
    pub timestamp: Option<DateTime<Local>>,
}

impl ChatEntry {
    pub fn message(
        sender: impl Into<String>,
        text: impl Into<String>,
        at: DateTime<Local>,
    ) -> Self {
        Self {
            kind: EntryKind::Message {
                sender: sender.into(),
            },
            text: text.into(),
            timestamp: Some(at),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::System,
            text: text.into(),
            timestamp: Some(Local::now()),
        }
    }

    pub fn is_system(&self) -> bool {
        self.kind == EntryKind::System
    }

    /// `HH:MM:SS` in lokaler Zeit bzw. `SYSTEM`
    pub fn time_label(&self) -> String {
        match &self.timestamp {
            Some(ts) => ts.format("%H:%M:%S").to_string(),
            None => "SYSTEM".to_string(),
        }
    }

    /// Eine Zeile Klartext
    pub fn render_text(&self) -> String {
        match &self.kind {
            EntryKind::Message { sender } => {
                format!("[{}] {}: {}", self.time_label(), sender, self.text)
            }
            EntryKind::System => format!("[{}] {}", self.time_label(), self.text),
        }
    }

    /// HTML-Fragment; Absender und Text werden escaped
    pub fn render_html(&self) -> String {
        match &self.kind {
            EntryKind::Message { sender } => format!(
                "<div class=\"message-item\"><div class=\"message-content\">\
                 <div class=\"message-header\"><span class=\"message-sender\">{}</span>\
                 <span class=\"message-time\">{}</span></div>\
                 <div class=\"message-text\">{}</div></div></div>",
                escape_html(sender),
                self.time_label(),
                escape_html(&self.text)
            ),
            EntryKind::System => format!(
                "<div class=\"system-message\"><span class=\"timestamp\">[{}]</span> \
                 <span class=\"message\">{}</span></div>",
                self.time_label(),
                escape_html(&self.text)
            ),
        }
    }
}

/// Escaped Text für HTML-Ausgabe
///
/// Entspricht `textContent` setzen und `innerHTML` lesen: nur `&`, `<`, `>`
/// und das geschützte Leerzeichen werden ersetzt, Anführungszeichen nicht.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            c => out.push(c),
        }
    }
    out
}

// ============================================================================
// EXPORT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Text,
    Html,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Text => "txt",
            ExportFormat::Html => "html",
        }
    }
}

// ============================================================================
// CHAT VIEW
// ============================================================================

/// Append-only Verlauf, nur `clear()` setzt ihn zurück
#[derive(Debug, Default)]
pub struct ChatView {
    entries: Vec<ChatEntry>,
}

impl ChatView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fügt eine Nachricht hinzu und gibt den Eintrag zurück
    pub fn add_message(
        &mut self,
        sender: &str,
        text: &str,
        timestamp: Option<&str>,
    ) -> ChatEntry {
        let at = timestamp
            .and_then(parse_timestamp)
            .unwrap_or_else(Local::now);
        self.push(ChatEntry::message(sender, text, at))
    }

    pub fn add_system(&mut self, text: &str) -> ChatEntry {
        self.push(ChatEntry::system(text))
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    /// Leert den Verlauf bis auf den `[SYSTEM]`-Hinweis
    pub fn clear(&mut self) -> ChatEntry {
        let notice = ChatEntry {
            kind: EntryKind::System,
            text: CLEARED_NOTICE.to_string(),
            timestamp: None,
        };
        self.entries = vec![notice.clone()];
        notice
    }

    pub fn render_text(&self) -> String {
        self.entries
            .iter()
            .map(|e| e.render_text())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn render_html(&self) -> String {
        let body: String = self.entries.iter().map(|e| e.render_html()).collect();
        format!(
            "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\
             <title>Metal-52 Chat</title></head>\n\
             <body><div id=\"chatMessages\">{}</div></body></html>\n",
            body
        )
    }

    /// Schreibt den Verlauf nach `dir` und gibt den Dateipfad zurück
    pub fn export(&self, dir: &Path, format: ExportFormat) -> std::io::Result<PathBuf> {
        self.export_dated(dir, format, Utc::now().date_naive())
    }

    fn export_dated(
        &self,
        dir: &Path,
        format: ExportFormat,
        date: NaiveDate,
    ) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;

        let path = dir.join(format!(
            "{}-{}.{}",
            EXPORT_PREFIX,
            date.format("%Y-%m-%d"),
            format.extension()
        ));
        let content = match format {
            ExportFormat::Text => self.render_text(),
            ExportFormat::Html => self.render_html(),
        };
        std::fs::write(&path, content)?;

        tracing::info!("Chat exported to {}", path.display());
        Ok(path)
    }

    fn push(&mut self, entry: ChatEntry) -> ChatEntry {
        self.entries.push(entry.clone());
        entry
    }
}

/// ISO-8601 vom Knoten; naive Zeitstempel gelten als lokal
fn parse_timestamp(raw: &str) -> Option<DateTime<Local>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Local));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .and_then(|naive| naive.and_local_timezone(Local).single())
}

// ============================================================================
// TESTS
// ============================================================================
