use anyhow::{bail, Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct FilterFile {
    pub path: PathBuf,
    pub content: String,
}

/// Everything the rewrite pass needs to know about the document up front:
/// which folder filters the file paths demand, which ones are already
/// declared, and which ItemGroup new declarations should go into.
#[derive(Debug)]
struct DocumentScan {
    required: BTreeSet<String>,
    existing: HashSet<String>,
    /// Ordinal of the first ItemGroup holding a Filter declaration, if any.
    filter_group: Option<usize>,
}

impl FilterFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read filters file: {}", path.display()))?;

        Ok(Self { path, content })
    }

    /// Brings the document in line with the physical paths of its file items:
    /// adds a Filter declaration for every missing folder (ancestors included)
    /// and rewrites each ClCompile/ClInclude folder assignment to match its
    /// Include path. Returns the number of folder filters added.
    pub fn sync(&mut self) -> Result<usize> {
        let scan = scan_document(&self.content)?;
        let (content, added) = rewrite_document(&self.content, &scan)?;
        self.content = content;
        Ok(added)
    }

    pub fn save(&self) -> Result<()> {
        fs::write(&self.path, &self.content)
            .with_context(|| format!("Failed to write filters file: {}", self.path.display()))?;
        Ok(())
    }
}

/// Converts a directory path to the backslash form Visual Studio expects,
/// with leading/trailing separators stripped. Empty means "no folder".
fn normalize_folder(folder: &str) -> String {
    folder.replace('/', "\\").trim_matches('\\').to_string()
}

/// Normalized directory of an Include path; either separator style is accepted.
fn folder_of(include: &str) -> String {
    let dir = match include.rfind(['/', '\\']) {
        Some(idx) => &include[..idx],
        None => "",
    };
    normalize_folder(dir)
}

fn include_attr(element: &BytesStart) -> Result<Option<String>> {
    Ok(match element.try_get_attribute("Include")? {
        Some(attr) => Some(attr.unescape_value()?.into_owned()),
        None => None,
    })
}

fn is_file_item(name: &[u8]) -> bool {
    name == b"ClCompile" || name == b"ClInclude"
}

/// Registers every non-empty prefix of the item's directory, so the folder
/// set stays prefix-closed (the IDE tree needs every ancestor as a node).
fn register_folders(required: &mut BTreeSet<String>, include: &str) {
    let dir = folder_of(include);
    if dir.is_empty() {
        return;
    }
    let parts: Vec<&str> = dir.split('\\').collect();
    for i in 1..=parts.len() {
        let prefix = parts[..i].join("\\");
        if !prefix.is_empty() {
            required.insert(prefix);
        }
    }
}

fn scan_document(content: &str) -> Result<DocumentScan> {
    let mut reader = Reader::from_str(content);
    let mut required = BTreeSet::new();
    let mut existing = HashSet::new();
    let mut filter_group = None;
    let mut group_count = 0usize;
    let mut current_group: Option<usize> = None;

    loop {
        match reader.read_event().context("Failed to parse filters file")? {
            Event::Start(e) => match e.name().as_ref() {
                b"ItemGroup" => {
                    current_group = Some(group_count);
                    group_count += 1;
                }
                b"Filter" => {
                    // A Filter declaration carries Include; the folder
                    // assignments inside file items do not.
                    if let Some(include) = include_attr(&e)? {
                        if filter_group.is_none() {
                            filter_group = current_group;
                        }
                        existing.insert(include);
                    }
                }
                name if is_file_item(name) => {
                    if let Some(include) = include_attr(&e)? {
                        register_folders(&mut required, &include);
                    }
                }
                _ => {}
            },
            // A self-closing ItemGroup counts towards the ordinals but never
            // becomes the current group, matching the rewrite pass.
            Event::Empty(e) => match e.name().as_ref() {
                b"ItemGroup" => group_count += 1,
                b"Filter" => {
                    if let Some(include) = include_attr(&e)? {
                        if filter_group.is_none() {
                            filter_group = current_group;
                        }
                        existing.insert(include);
                    }
                }
                name if is_file_item(name) => {
                    if let Some(include) = include_attr(&e)? {
                        register_folders(&mut required, &include);
                    }
                }
                _ => {}
            },
            Event::End(e) if e.name().as_ref() == b"ItemGroup" => current_group = None,
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(DocumentScan {
        required,
        existing,
        filter_group,
    })
}

/// Single rewrite pass over the event stream. Untouched content (namespace,
/// attributes, existing UniqueIdentifier values, whitespace) is passed
/// through verbatim so reruns leave the file byte-for-byte identical.
fn rewrite_document(content: &str, scan: &DocumentScan) -> Result<(String, usize)> {
    let missing: Vec<&str> = scan
        .required
        .iter()
        .filter(|folder| !scan.existing.contains(folder.as_str()))
        .map(String::as_str)
        .collect();

    let mut reader = Reader::from_str(content);
    let mut writer = Writer::new(Vec::new());
    let mut group_count = 0usize;
    let mut current_group: Option<usize> = None;
    let mut need_decl = true;

    loop {
        let event = reader.read_event().context("Failed to parse filters file")?;

        if need_decl {
            need_decl = false;
            if !matches!(event, Event::Decl(_) | Event::Eof) {
                writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
                writer.write_event(Event::Text(BytesText::new("\n")))?;
            }
        }

        match event {
            Event::Start(e) => {
                let item = {
                    let name = e.name();
                    if name.as_ref() == b"ItemGroup" {
                        current_group = Some(group_count);
                        group_count += 1;
                        None
                    } else if is_file_item(name.as_ref()) {
                        include_attr(&e)?.map(|include| (name.as_ref().to_vec(), include))
                    } else {
                        None
                    }
                };
                writer.write_event(Event::Start(e))?;
                if let Some((tag, include)) = item {
                    let dir = folder_of(&include);
                    rewrite_item_children(&mut reader, &mut writer, &tag, &dir)?;
                }
            }
            Event::Empty(e) => {
                let item = {
                    let name = e.name();
                    if name.as_ref() == b"ItemGroup" {
                        group_count += 1;
                        None
                    } else if is_file_item(name.as_ref()) {
                        include_attr(&e)?
                            .map(|include| (String::from_utf8_lossy(name.as_ref()).into_owned(), include))
                    } else {
                        None
                    }
                };
                match item {
                    // Self-closing items get expanded so the folder
                    // assignment child has somewhere to live.
                    Some((tag, include)) => {
                        let dir = folder_of(&include);
                        writer.write_event(Event::Start(e))?;
                        write_folder_assignment(&mut writer, &dir)?;
                        writer.write_event(Event::End(BytesEnd::new(tag)))?;
                    }
                    // Items without Include are left alone.
                    None => writer.write_event(Event::Empty(e))?,
                }
            }
            Event::End(e) => {
                let name = e.name();
                if name.as_ref() == b"ItemGroup" {
                    if scan.filter_group.is_some() && current_group == scan.filter_group {
                        for folder in &missing {
                            writer.write_event(Event::Text(BytesText::new("  ")))?;
                            write_filter_declaration(&mut writer, folder)?;
                            writer.write_event(Event::Text(BytesText::new("\n  ")))?;
                        }
                    }
                    current_group = None;
                } else if name.as_ref() == b"Project" && scan.filter_group.is_none() {
                    write_new_filter_group(&mut writer, &missing)?;
                }
                writer.write_event(Event::End(e))?;
            }
            Event::Eof => break,
            other => writer.write_event(other)?,
        }
    }

    let content = String::from_utf8(writer.into_inner())
        .context("Rewritten filters document is not valid UTF-8")?;
    Ok((content, missing.len()))
}

/// Streams the children of a file item, dropping any existing folder
/// assignments (all of them, not just the first) and appending the one
/// matching the item's physical directory just before the closing tag.
fn rewrite_item_children<W: Write>(
    reader: &mut Reader<&[u8]>,
    writer: &mut Writer<W>,
    tag: &[u8],
    dir: &str,
) -> Result<()> {
    // Indentation travels with the element it precedes, so whitespace is
    // held back until we know whether its element survives.
    let mut pending_ws = None;

    loop {
        match reader.read_event().context("Failed to parse filters file")? {
            Event::Text(t) if t.iter().all(|b| b.is_ascii_whitespace()) => {
                if let Some(ws) = pending_ws.replace(Event::Text(t)) {
                    writer.write_event(ws)?;
                }
            }
            Event::Start(c) if c.name().as_ref() == b"Filter" => {
                pending_ws = None;
                reader
                    .read_to_end(c.name())
                    .context("Failed to parse filters file")?;
            }
            Event::Empty(c) if c.name().as_ref() == b"Filter" => pending_ws = None,
            Event::End(c) if c.name().as_ref() == tag => {
                write_folder_assignment(writer, dir)?;
                writer.write_event(Event::End(c))?;
                return Ok(());
            }
            Event::Eof => bail!(
                "Unexpected end of document inside <{}>",
                String::from_utf8_lossy(tag)
            ),
            other => {
                if let Some(ws) = pending_ws.take() {
                    writer.write_event(ws)?;
                }
                writer.write_event(other)?;
            }
        }
    }
}

fn write_folder_assignment<W: Write>(writer: &mut Writer<W>, dir: &str) -> Result<()> {
    // Root-level files display under "." rather than an empty folder name.
    let value = if dir.is_empty() { "." } else { dir };
    writer.write_event(Event::Text(BytesText::new("\n      ")))?;
    writer.write_event(Event::Start(BytesStart::new("Filter")))?;
    writer.write_event(Event::Text(BytesText::new(value)))?;
    writer.write_event(Event::End(BytesEnd::new("Filter")))?;
    writer.write_event(Event::Text(BytesText::new("\n    ")))?;
    Ok(())
}

fn write_filter_declaration<W: Write>(writer: &mut Writer<W>, folder: &str) -> Result<()> {
    let id = format!("{{{}}}", uuid::Uuid::new_v4().to_string().to_uppercase());
    let mut start = BytesStart::new("Filter");
    start.push_attribute(("Include", folder));
    writer.write_event(Event::Start(start))?;
    writer.write_event(Event::Text(BytesText::new("\n      ")))?;
    writer.write_event(Event::Start(BytesStart::new("UniqueIdentifier")))?;
    writer.write_event(Event::Text(BytesText::new(&id)))?;
    writer.write_event(Event::End(BytesEnd::new("UniqueIdentifier")))?;
    writer.write_event(Event::Text(BytesText::new("\n    ")))?;
    writer.write_event(Event::End(BytesEnd::new("Filter")))?;
    Ok(())
}

/// When the document has no Filter declarations at all, new ones go into a
/// fresh ItemGroup appended just before the closing Project tag.
fn write_new_filter_group<W: Write>(writer: &mut Writer<W>, missing: &[&str]) -> Result<()> {
    writer.write_event(Event::Text(BytesText::new("  ")))?;
    writer.write_event(Event::Start(BytesStart::new("ItemGroup")))?;
    for folder in missing {
        writer.write_event(Event::Text(BytesText::new("\n    ")))?;
        write_filter_declaration(writer, folder)?;
    }
    writer.write_event(Event::Text(BytesText::new("\n  ")))?;
    writer.write_event(Event::End(BytesEnd::new("ItemGroup")))?;
    writer.write_event(Event::Text(BytesText::new("\n")))?;
    Ok(())
}
