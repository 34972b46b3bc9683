//! Reading tree files and writing tabular results.
//!
//! The engine proper is format-agnostic: it consumes [`crate::tree::Tree`]
//! values. This module supplies the bundled reader — format auto-detection,
//! Newick and BEAST/NEXUS parsing via `phylotree`, gzip-compressed input —
//! and the TSV writers used by the CLI.

use crate::error::{Error, Result};
use crate::tree::{NodeId, Tree};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use phylotree::tree::Tree as PhyloTree;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

/// Tree file formats the reader can be asked for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Format {
    Auto,
    Newick,
    Nexus,
    PhyloXml,
    NeXml,
    PhyJson,
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Format::Auto => "auto",
            Format::Newick => "newick",
            Format::Nexus => "nexus",
            Format::PhyloXml => "phyloxml",
            Format::NeXml => "nexml",
            Format::PhyJson => "phyjson",
        };
        f.write_str(name)
    }
}

/// Guess the format from the first marker in the content.
///
/// `(` starts a Newick statement, `#NEXUS` a NEXUS file, `<?xml` an XML
/// dialect disambiguated by a `phyloxml`/`nexml` token, `{` a PhyJSON
/// document. Anything else is treated as Newick.
pub fn detect_format(content: &str) -> Format {
    let trimmed = content.trim_start();
    if trimmed.starts_with('(') {
        return Format::Newick;
    }
    let lower_head: String = trimmed.chars().take(512).collect::<String>().to_lowercase();
    if lower_head.starts_with("#nexus") {
        return Format::Nexus;
    }
    if lower_head.starts_with("<?xml") || lower_head.starts_with('<') {
        if lower_head.contains("phyloxml") {
            return Format::PhyloXml;
        }
        if lower_head.contains("nexml") {
            return Format::NeXml;
        }
    }
    if trimmed.starts_with('{') {
        return Format::PhyJson;
    }
    Format::Newick
}

/// Parse an ordered sequence of trees out of `content`.
///
/// `Format::Auto` applies [`detect_format`] first. Newick and NEXUS parse;
/// the XML and JSON dialects are recognised but not bundled, and report a
/// `ParseFailure` naming the format so the caller can plug in an external
/// reader.
pub fn read_trees(content: &str, format: Format) -> Result<Vec<Tree>> {
    let resolved = match format {
        Format::Auto => detect_format(content),
        other => other,
    };
    // Auto-detection falling through to Newick without the `(` marker is a
    // guess; a guess that fails to parse means the format was never known.
    let newick_is_guess =
        format == Format::Auto && !content.trim_start().starts_with('(');
    match resolved {
        Format::Newick => {
            let trees = match read_newick(content) {
                Ok(trees) => trees,
                Err(e) if newick_is_guess => {
                    return Err(Error::FormatUnknown {
                        detail: format!("input matches no known tree format ({e})"),
                    });
                }
                Err(e) => return Err(e),
            };
            if trees.is_empty() {
                if format == Format::Auto {
                    return Err(Error::FormatUnknown {
                        detail: "input matched no known tree format and contains no Newick statement"
                            .into(),
                    });
                }
                return Err(Error::parse("no Newick tree statement found"));
            }
            Ok(trees)
        }
        Format::Nexus => {
            let trees = read_nexus(content)?;
            if trees.is_empty() {
                return Err(Error::parse("NEXUS file contains no tree statements"));
            }
            Ok(trees)
        }
        Format::PhyloXml | Format::NeXml | Format::PhyJson => Err(Error::parse(format!(
            "format '{resolved}' requires an external tree reader"
        ))),
        Format::Auto => unreachable!("auto resolves above"),
    }
}

/// Read trees from a file, transparently gunzipping `.gz` paths.
pub fn read_trees_file<P: AsRef<Path>>(path: P, format: Format) -> Result<Vec<Tree>> {
    let path = path.as_ref();
    let mut content = String::new();
    if path.to_string_lossy().ends_with(".gz") {
        let mut decoder = GzDecoder::new(File::open(path)?);
        decoder.read_to_string(&mut content)?;
    } else {
        let mut file = File::open(path)?;
        file.read_to_string(&mut content)?;
    }
    read_trees(&content, format)
}

fn read_newick(content: &str) -> Result<Vec<Tree>> {
    let mut trees = Vec::new();
    for (idx, statement) in content
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .enumerate()
    {
        let newick = format!("{};", strip_beast_annotations(statement));
        let parsed = PhyloTree::from_newick(&newick)
            .map_err(|e| Error::parse(format!("Newick statement {idx}: {e}")))?;
        trees.push(convert(&parsed)?);
    }
    Ok(trees)
}

fn read_nexus(content: &str) -> Result<Vec<Tree>> {
    let translate = parse_translate_block(content);
    let mut trees = Vec::new();
    for (idx, body) in collect_tree_statements(content).into_iter().enumerate() {
        let newick = strip_beast_annotations(&body);
        let mut parsed = PhyloTree::from_newick(&newick)
            .map_err(|e| Error::parse(format!("NEXUS tree statement {idx}: {e}")))?;
        if !translate.is_empty() {
            rename_leaf_nodes(&mut parsed, &translate);
        }
        trees.push(convert(&parsed)?);
    }
    Ok(trees)
}

/// Strip BEAST annotations from Newick strings.
///
/// BEAST writes `:[&rate=0.123]2.45` where 2.45 is the actual branch
/// length; the `[&...]` block is removed and everything else kept.
fn strip_beast_annotations(newick: &str) -> String {
    let mut result = String::with_capacity(newick.len());
    let mut in_annotation = false;
    let mut chars = newick.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '[' && chars.peek() == Some(&'&') {
            in_annotation = true;
        } else if ch == ']' && in_annotation {
            in_annotation = false;
        } else if !in_annotation {
            result.push(ch);
        }
    }

    result
}

/// Extract the Newick bodies of `tree NAME = ...;` statements.
fn collect_tree_statements(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| {
            let upper = line.to_ascii_uppercase();
            upper.starts_with("TREE ") || upper.starts_with("TREE\t")
        })
        .filter_map(|line| {
            let (_, body) = line.split_once('=')?;
            // Drop rooting comments like [&R] before the parenthesis
            let body = body.trim();
            Some(body.to_string())
        })
        .collect()
}

/// Parse the TRANSLATE block into an id → label mapping.
fn parse_translate_block(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .skip_while(|line| !line.trim().to_ascii_uppercase().starts_with("TRANSLATE"))
        .skip(1)
        .take_while(|line| !line.trim().starts_with(';'))
        .filter_map(|line| {
            let line = line.trim().trim_end_matches(',');
            let mut parts = line.split_whitespace();
            let id = parts.next()?.to_string();
            let label = parts.next()?.trim_matches('\'').to_string();
            Some((id, label))
        })
        .collect()
}

fn rename_leaf_nodes(tree: &mut PhyloTree, translate: &HashMap<String, String>) {
    for leaf_id in tree.get_leaves() {
        if let Ok(node) = tree.get_mut(&leaf_id) {
            node.name = node
                .name
                .as_ref()
                .map(|n| translate.get(n).cloned().unwrap_or_else(|| n.clone()));
        }
    }
}

/// Convert a parsed `phylotree` tree into the engine's arena tree.
///
/// Child order is preserved; node heights are computed from branch lengths
/// once the copy is complete.
fn convert(src: &PhyloTree) -> Result<Tree> {
    let src_root = src
        .get_root()
        .map_err(|e| Error::parse(format!("tree has no root: {e}")))?;
    let root = src
        .get(&src_root)
        .map_err(|e| Error::parse(e.to_string()))?;
    let mut tree = Tree::with_root(root.name.clone(), root.parent_edge);

    let mut stack: Vec<(usize, NodeId)> = vec![(src_root, tree.root())];
    while let Some((src_id, dst_id)) = stack.pop() {
        let node = src.get(&src_id).map_err(|e| Error::parse(e.to_string()))?;
        for &src_child in &node.children {
            let child = src
                .get(&src_child)
                .map_err(|e| Error::parse(e.to_string()))?;
            let dst_child = tree.add_child(dst_id, child.name.clone(), child.parent_edge);
            stack.push((src_child, dst_child));
        }
    }

    tree.compute_heights();
    Ok(tree)
}

/// Write a labeled square matrix as TSV. Gzip-compresses when the path
/// ends with `.gz`.
pub fn write_matrix_tsv<P: AsRef<Path>, T: std::fmt::Display>(
    path: P,
    names: &[String],
    mat: &[Vec<T>],
) -> Result<()> {
    let mut out = open_writer(path.as_ref())?;

    write!(&mut out, "\t")?;
    for (k, name) in names.iter().enumerate() {
        if k > 0 {
            write!(&mut out, "\t")?;
        }
        write!(&mut out, "{}", name)?;
    }
    writeln!(&mut out)?;

    for (i, row) in mat.iter().enumerate() {
        write!(&mut out, "{}", names[i])?;
        for val in row {
            write!(&mut out, "\t{}", val)?;
        }
        writeln!(&mut out)?;
    }

    out.flush()?;
    Ok(())
}

/// Write labeled 2D coordinates as TSV. Gzip-compresses when the path
/// ends with `.gz`.
pub fn write_coords_tsv<P: AsRef<Path>>(
    path: P,
    names: &[String],
    coords: &[[f64; 2]],
) -> Result<()> {
    let mut out = open_writer(path.as_ref())?;
    writeln!(&mut out, "label\tx\ty")?;
    for (name, xy) in names.iter().zip(coords) {
        writeln!(&mut out, "{}\t{}\t{}", name, xy[0], xy[1])?;
    }
    out.flush()?;
    Ok(())
}

fn open_writer(path: &Path) -> Result<Box<dyn Write>> {
    let file = File::create(path)?;
    let out: Box<dyn Write> = if path.to_string_lossy().ends_with(".gz") {
        Box::new(BufWriter::new(GzEncoder::new(file, Compression::default())))
    } else {
        Box::new(BufWriter::new(file))
    };
    Ok(out)
}
