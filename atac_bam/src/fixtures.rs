//! BAM fixtures for unit tests, built from literal SAM lines.

use rust_htslib::bam::header::{Header, HeaderRecord};
use rust_htslib::bam::{self, Read};
use std::path::Path;

/// Coordinate-sorted header with contigs chr1 (10000bp) and chr2 (8000bp).
pub(crate) fn two_contig_header() -> Header {
    let mut header = Header::new();
    let mut hd = HeaderRecord::new(b"HD");
    hd.push_tag(b"VN", "1.6");
    hd.push_tag(b"SO", "coordinate");
    header.push_record(&hd);
    push_contig(&mut header, "chr1", 10000);
    push_contig(&mut header, "chr2", 8000);
    header
}

pub(crate) fn push_contig(header: &mut Header, name: &str, len: usize) {
    let mut sq = HeaderRecord::new(b"SQ");
    sq.push_tag(b"SN", name);
    sq.push_tag(b"LN", len);
    header.push_record(&sq);
}

/// Write `sam_lines` (full SAM records, tab separated, 1-based positions)
/// into a BAM at `path`.
pub(crate) fn write_bam<S: AsRef<str>>(path: &Path, header: &Header, sam_lines: &[S]) {
    let view = bam::HeaderView::from_header(header);
    let mut writer = bam::Writer::from_path(path, header, bam::Format::Bam).unwrap();
    for line in sam_lines {
        let rec = bam::Record::from_sam(&view, line.as_ref().as_bytes()).unwrap();
        writer.write(&rec).unwrap();
    }
}

/// Qnames of all records in `path`, in file order.
pub(crate) fn read_qnames(path: &Path) -> Vec<String> {
    let mut reader = bam::Reader::from_path(path).unwrap();
    reader
        .records()
        .map(|r| String::from_utf8(r.unwrap().qname().to_vec()).unwrap())
        .collect()
}

/// (qname, tid, pos) triples of all records in `path`, in file order.
pub(crate) fn read_coordinates(path: &Path) -> Vec<(String, i32, i64)> {
    let mut reader = bam::Reader::from_path(path).unwrap();
    reader
        .records()
        .map(|r| {
            let rec = r.unwrap();
            (
                String::from_utf8(rec.qname().to_vec()).unwrap(),
                rec.tid(),
                rec.pos(),
            )
        })
        .collect()
}

/// A proper pair of SAM lines at the given 1-based positions on `chrom`.
pub(crate) fn proper_pair(qname: &str, chrom: &str, pos1: i64, pos2: i64) -> [String; 2] {
    let tlen = pos2 + 50 - pos1;
    [
        format!(
            "{qname}\t99\t{chrom}\t{pos1}\t60\t50M\t=\t{pos2}\t{tlen}\t{}\t{}",
            "A".repeat(50),
            "F".repeat(50)
        ),
        format!(
            "{qname}\t147\t{chrom}\t{pos2}\t60\t50M\t=\t{pos1}\t-{tlen}\t{}\t{}",
            "A".repeat(50),
            "F".repeat(50)
        ),
    ]
}
