//! Plain-text leak report: dump summary, top classes and top objects by
//! retained size, optional unreachable-garbage section.

use indoc::formatdoc;

use crate::errors::HprofRetainError;
use crate::index::builder::RecordTallies;
use crate::snapshot::Snapshot;
use crate::utils::pretty_bytes_size;

pub fn render_summary(snapshot: &Snapshot) -> String {
    let manifest = snapshot.manifest();
    formatdoc!(
        "\nHeap snapshot summary:

        Format: {} ({}-byte identifiers)
        Objects: {}
        Classes: {}
        GC roots: {}
        References: {}
        Unresolved references: {}
        Reachable heap: {}
        Unreachable garbage: {} in {} objects",
        manifest.format,
        manifest.id_size,
        manifest.object_count,
        manifest.class_count,
        manifest.root_count,
        manifest.edge_count,
        manifest.unresolved_references,
        pretty_bytes_size(manifest.total_retained_bytes),
        pretty_bytes_size(manifest.unreachable_bytes),
        manifest.unreachable_objects,
    )
}

pub fn render_parse_summary(tallies: &RecordTallies) -> String {
    formatdoc!(
        "\nFile content summary:

        UTF-8 strings: {}
        Classes loaded: {}
        Classes unloaded: {}
        Stack traces: {}
        Stack frames: {}
        Start threads: {}
        End threads: {}
        Allocation sites: {}
        Heap summaries: {}
        Control settings: {}
        CPU samples: {}
        Heap dump segments: {}
        ..GC roots: {}
        ..GC class dumps: {}
        ..GC instance dumps: {}
        ..GC object array dumps: {}
        ..GC primitive array dumps: {}",
        tallies.utf8_strings,
        tallies.classes_loaded,
        tallies.classes_unloaded,
        tallies.stack_traces,
        tallies.stack_frames,
        tallies.start_threads,
        tallies.end_threads,
        tallies.alloc_sites,
        tallies.heap_summaries,
        tallies.control_settings,
        tallies.cpu_samples,
        tallies.heap_dump_segments,
        tallies.gc_roots,
        tallies.class_dumps,
        tallies.instances,
        tallies.object_arrays,
        tallies.primitive_arrays,
    )
}

/// Classes ranked by aggregated retained size; the leak suspects.
pub fn render_top_classes(snapshot: &Snapshot, top: usize) -> Result<String, HprofRetainError> {
    let mut per_class = snapshot.retained_by_class()?;
    per_class.retain(|entry| entry.instances > 0);
    per_class.sort_by(|a, b| {
        b.retained
            .cmp(&a.retained)
            .then_with(|| a.class_index.cmp(&b.class_index))
    });

    let classes = snapshot.classes();
    let rows: Vec<[String; 4]> = per_class
        .iter()
        .take(top)
        .map(|entry| {
            [
                pretty_bytes_size(entry.retained),
                pretty_bytes_size(entry.shallow),
                entry.instances.to_string(),
                classes[entry.class_index as usize].name.to_string(),
            ]
        })
        .collect();

    let mut out = format!("\nTop {} classes by retained size:\n\n", rows.len());
    render_table(
        &mut out,
        ["Retained", "Shallow", "Instances", "Class name"],
        &rows,
    );
    Ok(out)
}

/// Single objects ranked by retained size.
pub fn render_top_objects(snapshot: &Snapshot, top: usize) -> Result<String, HprofRetainError> {
    let mut ranked: Vec<(u64, u32)> = Vec::with_capacity(snapshot.object_count() as usize);
    for id in 0..snapshot.object_count() {
        ranked.push((snapshot.retained_size(id)?, id));
    }
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    let mut rows: Vec<[String; 4]> = Vec::new();
    for &(retained, id) in ranked.iter().take(top) {
        rows.push([
            pretty_bytes_size(retained),
            pretty_bytes_size(snapshot.shallow_size(id)?),
            format!("0x{:x}", snapshot.identifier_of(id)?),
            snapshot.class_of(id)?.name.to_string(),
        ]);
    }

    let mut out = format!("\nTop {} objects by retained size:\n\n", rows.len());
    render_table(
        &mut out,
        ["Retained", "Shallow", "Address", "Class name"],
        &rows,
    );
    Ok(out)
}

pub fn render_unreachable(snapshot: &Snapshot) -> String {
    format!(
        "\n{} of unreachable garbage in {} objects was excluded from the dominator tree.\n",
        pretty_bytes_size(snapshot.unreachable_bytes()),
        snapshot.unreachable_count()
    )
}

// Right-align every column except the trailing name column.
fn render_table<const N: usize>(out: &mut String, headers: [&str; N], rows: &[[String; N]]) {
    let mut widths: [usize; N] = [0; N];
    for (i, header) in headers.iter().enumerate() {
        widths[i] = header.chars().count();
    }
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let mut header_line = String::new();
    for (i, header) in headers.iter().enumerate() {
        if i > 0 {
            header_line.push_str(" | ");
        }
        if i + 1 == N {
            header_line.push_str(header);
        } else {
            header_line.push_str(&" ".repeat(widths[i] - header.chars().count()));
            header_line.push_str(header);
        }
    }
    out.push_str(&header_line);
    out.push('\n');
    out.push_str(&"-".repeat(header_line.chars().count().max(widths.iter().sum::<usize>())));
    out.push('\n');

    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i > 0 {
                out.push_str(" | ");
            }
            if i + 1 != N {
                out.push_str(&" ".repeat(widths[i] - cell.chars().count()));
            }
            out.push_str(cell);
        }
        out.push('\n');
    }
}
