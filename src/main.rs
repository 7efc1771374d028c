use anyhow::{Context, Result};
use clap::Parser;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ─── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(author, version, about = "Fingerprint software versions from their network traffic: learn which packet shapes and payload bytes never vary across captures of a known version, then diff captures of other versions against that model, exporting per-packet CSV diffs and filtered pcaps of the anomalous packets.")]
struct Args {
    /// Directory containing per-version .pcap capture files
    pcap_dir: PathBuf,

    /// Path to the JSON job configuration (defaults to <pcap_dir>/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only consider packets captured within this many seconds of each capture's first packet
    #[arg(long)]
    time_limit: Option<f64>,

    /// Worker threads for invariant-position computation (0 = auto-detect)
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Print the run summary as JSON to stdout
    #[arg(long, default_value_t = false)]
    report: bool,

    /// Enable debug logging
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

// ─── Config ───────────────────────────────────────────────────────────────────
//
// The job file lists every version taking part in the run. Each version gets
// fingerprinted in turn and compared against the held-out captures of all
// versions (itself included). Extra fields written by capture tooling are
// ignored.

#[derive(Debug, Deserialize)]
struct Config {
    /// Application name, informational only; capture files are matched by the
    /// directory name instead.
    name: String,
    #[serde(default)]
    label: Option<String>,
    jobs: Vec<Job>,
}

#[derive(Debug, Deserialize)]
struct Job {
    version: String,
}

fn load_config(path: &Path) -> Result<Config> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Cannot read config {:?}", path))?;
    let config: Config = serde_json::from_str(&text)
        .with_context(|| format!("Invalid JSON in {:?}", path))?;
    if config.name.trim().is_empty() {
        return Err(anyhow::anyhow!("config field 'name' must not be empty"));
    }
    if config.jobs.is_empty() {
        return Err(anyhow::anyhow!("config must list at least one job"));
    }
    if config.jobs.iter().any(|j| j.version.trim().is_empty()) {
        return Err(anyhow::anyhow!("every config job needs a non-empty 'version'"));
    }
    Ok(config)
}

// ─── Data model ───────────────────────────────────────────────────────────────

/// A packet shape: highest recognized protocol plus application payload
/// length. Shapes recur across captures of the same version; that recurrence
/// is the fingerprinting signal.
type PacketKey = (String, usize);

#[derive(Debug, Clone)]
struct PacketRecord {
    proto:   String,
    length:  usize,
    payload: Vec<u8>,
    /// 1-based frame number within the capture file.
    number:  u64,
}

impl PacketRecord {
    fn key(&self) -> PacketKey {
        (self.proto.clone(), self.length)
    }
}

#[derive(Debug, Default)]
struct FingerprintEntry {
    /// First payload seen for this shape, in file-sorted then frame order.
    /// All diffing for the shape is anchored to this payload.
    baseline:  Vec<u8>,
    /// Every distinct payload observed for this shape across all fingerprint
    /// captures.
    payloads:  HashSet<Vec<u8>>,
    /// Byte positions where every observed payload agrees with the baseline.
    /// Only populated for common shapes.
    invariant: Option<BTreeSet<usize>>,
}

#[derive(Debug)]
struct Fingerprint {
    entries: HashMap<PacketKey, FingerprintEntry>,
    /// Shapes observed at least once in *every* capture used to build the
    /// fingerprint. Always a subset of the entry keys.
    common_keys: BTreeSet<PacketKey>,
}

#[derive(Debug, Clone)]
struct ComparisonRow {
    /// 0 for synthesized missing-packet rows; no real frame corresponds.
    number:              u64,
    total_packets:       usize,
    proto:               String,
    length:              usize,
    new_packet:          bool,
    missing_packet:      bool,
    payload:             Vec<u8>,
    diff_indices:        Vec<usize>,
    fingerprint_indices: Vec<usize>,
}

#[derive(Debug)]
struct ComparisonResult {
    /// Rows in packet-arrival order, missing-packet rows appended last in
    /// sorted key order. Unchanged packets produce no row.
    rows:          Vec<ComparisonRow>,
    total_packets: usize,
}

impl ComparisonResult {
    /// Frame numbers to extract into the filtered capture. The missing-row
    /// sentinel 0 never names a real frame and is excluded.
    fn packet_numbers(&self) -> HashSet<u64> {
        self.rows.iter().map(|r| r.number).filter(|&n| n != 0).collect()
    }
}

// ─── Stats ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize)]
struct RunStats {
    captures_decoded:   u64,
    packets_decoded:    u64,
    fingerprints_built: u64,
    common_keys_total:  u64,
    comparisons_run:    u64,
    comparisons_failed: u64,
    changed_rows:       u64,
    new_rows:           u64,
    missing_rows:       u64,
    csv_files_written:  u64,
    pcap_files_written: u64,
}

// ─── Payload diffing ──────────────────────────────────────────────────────────

/// Indices below both payloads' lengths where the bytes agree. Positions past
/// the shorter payload are never included.
fn agreement_positions(a: &[u8], b: &[u8]) -> BTreeSet<usize> {
    (0..a.len().min(b.len())).filter(|&i| a[i] == b[i]).collect()
}

/// Indices from `positions`, ascending, where the two payloads disagree.
/// Positions past either payload's end are skipped rather than reported;
/// shapes key payloads by length, so in practice every position is in range.
fn restricted_disagreement(baseline: &[u8], candidate: &[u8], positions: &BTreeSet<usize>) -> Vec<usize> {
    positions
        .iter()
        .copied()
        .filter(|&i| i < baseline.len() && i < candidate.len() && baseline[i] != candidate[i])
        .collect()
}

/// Byte positions where every payload agrees with the baseline: the
/// baseline's full index range, narrowed by the agreement set of each other
/// payload. A single payload keeps the full range.
fn invariant_positions<'a, I>(baseline: &[u8], payloads: I) -> BTreeSet<usize>
where
    I: IntoIterator<Item = &'a Vec<u8>>,
{
    let mut mutual: BTreeSet<usize> = (0..baseline.len()).collect();
    for p in payloads {
        if mutual.is_empty() {
            break;
        }
        let agreement = agreement_positions(baseline, p);
        mutual = mutual.intersection(&agreement).copied().collect();
    }
    mutual
}

// ─── Protocol naming ──────────────────────────────────────────────────────────

/// Well-known TCP/UDP ports → application protocol names. Consulted only when
/// a segment actually carries payload, so a bare SYN to port 443 stays "TCP".
fn port_protocol(port: u16) -> Option<&'static str> {
    Some(match port {
        20 | 21    => "FTP",
        22         => "SSH",
        23         => "TELNET",
        25         => "SMTP",
        53         => "DNS",
        67 | 68    => "DHCP",
        80 | 8080  => "HTTP",
        88         => "KERBEROS",
        110        => "POP3",
        123        => "NTP",
        143        => "IMAP",
        161 | 162  => "SNMP",
        179        => "BGP",
        389        => "LDAP",
        443 | 8443 => "TLS",
        445        => "SMB",
        514        => "SYSLOG",
        5353       => "MDNS",
        _ => return None,
    })
}

/// Name the highest recognized layer of a TCP/UDP segment starting at `t_off`.
fn transport_protocol(raw: &[u8], t_off: usize, transport: &str, payload: &[u8]) -> String {
    if payload.is_empty() {
        return transport.to_string();
    }
    let src_port = u16::from_be_bytes([raw[t_off], raw[t_off + 1]]);
    let dst_port = u16::from_be_bytes([raw[t_off + 2], raw[t_off + 3]]);
    for port in [src_port, dst_port] {
        if let Some(name) = port_protocol(port) {
            return name.to_string();
        }
    }
    transport.to_string()
}

// ─── Packet extraction ────────────────────────────────────────────────────────

/// Application payload of the TCP (data offset honored) or UDP segment at
/// `t_off`. Empty when the segment is truncated or carries no payload.
fn transport_payload(raw: &[u8], t_off: usize, ip_proto: u8) -> Vec<u8> {
    let payload_off = match ip_proto {
        6 if raw.len() >= t_off + 20 => {
            let doff = ((raw[t_off + 12] >> 4) as usize) * 4;
            t_off + doff
        }
        17 if raw.len() >= t_off + 8 => t_off + 8,
        _ => return Vec::new(),
    };
    if payload_off < raw.len() {
        raw[payload_off..].to_vec()
    } else {
        Vec::new()
    }
}

/// Reduce one Ethernet frame to its shape and payload. The length is always
/// the application-layer payload length; frames without a decodable TCP/UDP
/// payload get length 0 and an empty payload.
fn dissect_frame(raw: &[u8], number: u64) -> PacketRecord {
    let mut proto = "ETH".to_string();
    let mut payload: Vec<u8> = Vec::new();

    if raw.len() >= 14 {
        let ethertype = u16::from_be_bytes([raw[12], raw[13]]);
        // Handle 802.1Q VLAN tag — inner ethertype
        let (ip_off, real_ethertype) = if ethertype == 0x8100 && raw.len() >= 18 {
            (18usize, u16::from_be_bytes([raw[16], raw[17]]))
        } else {
            (14usize, ethertype)
        };

        match real_ethertype {
            0x0806 => proto = "ARP".to_string(),
            0x0800 if raw.len() >= ip_off + 20 => {
                proto = "IP".to_string();
                let ihl      = ((raw[ip_off] & 0x0f) as usize) * 4;
                let ip_proto = raw[ip_off + 9];
                let t_off    = ip_off + ihl;
                match ip_proto {
                    1 => proto = "ICMP".to_string(),
                    6 | 17 if raw.len() >= t_off + 4 => {
                        payload = transport_payload(raw, t_off, ip_proto);
                        let transport = if ip_proto == 6 { "TCP" } else { "UDP" };
                        proto = transport_protocol(raw, t_off, transport, &payload);
                    }
                    _ => {}
                }
            }
            0x86DD if raw.len() >= ip_off + 40 => {
                proto = "IPV6".to_string();
                let next_header = raw[ip_off + 6];
                let t_off = ip_off + 40; // fixed header only, no extension-header walk
                match next_header {
                    58 => proto = "ICMPV6".to_string(),
                    6 | 17 if raw.len() >= t_off + 4 => {
                        payload = transport_payload(raw, t_off, next_header);
                        let transport = if next_header == 6 { "TCP" } else { "UDP" };
                        proto = transport_protocol(raw, t_off, transport, &payload);
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    let length = payload.len();
    PacketRecord { proto, length, payload, number }
}

/// Decode a legacy pcap file into ordered packet records. With a time limit,
/// only frames within that many seconds of the capture's first frame are
/// kept; frame numbering still counts every frame in the file.
fn extract_capture(path: &Path, time_limit: Option<f64>) -> Result<Vec<PacketRecord>> {
    let file = File::open(path).with_context(|| format!("Cannot open {:?}", path))?;
    let mut reader = LegacyPcapReader::new(65536, BufReader::new(file))
        .with_context(|| format!("Not a valid legacy pcap file: {:?}", path))?;

    let mut records: Vec<PacketRecord> = Vec::new();
    let mut number: u64 = 0;
    let mut first_ts: Option<f64> = None;

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                let frame: Option<(f64, Vec<u8>)> = match block {
                    PcapBlockOwned::Legacy(ref pkt) => {
                        number += 1;
                        let ts = pkt.ts_sec as f64 + pkt.ts_usec as f64 / 1_000_000.0;
                        Some((ts, pkt.data.to_vec()))
                    }
                    PcapBlockOwned::LegacyHeader(_) => None,
                    PcapBlockOwned::NG(_) => {
                        warn!("pcapng block in {:?} – only legacy pcap supported", path);
                        None
                    }
                };
                drop(block);
                reader.consume(offset);

                if let Some((ts, raw)) = frame {
                    let rel = ts - *first_ts.get_or_insert(ts);
                    if time_limit.map_or(true, |limit| rel < limit) {
                        records.push(dissect_frame(&raw, number));
                    }
                }
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete) => {
                if let Err(e) = reader.refill() {
                    return Err(anyhow::anyhow!("refill error in {:?}: {:?}", path, e));
                }
            }
            Err(e) => return Err(anyhow::anyhow!("pcap parse error in {:?}: {:?}", path, e)),
        }
    }

    debug!("Extracted {} packets from {:?}", records.len(), path);
    Ok(records)
}

/// Decoded captures keyed by path, owned by the run loop. Capture files are
/// immutable once written, so entries are never invalidated.
struct PacketCache {
    map:        HashMap<PathBuf, Vec<PacketRecord>>,
    time_limit: Option<f64>,
}

impl PacketCache {
    fn new(time_limit: Option<f64>) -> Self {
        Self { map: HashMap::new(), time_limit }
    }

    fn records(&mut self, path: &Path) -> Result<&[PacketRecord]> {
        let records = match self.map.entry(path.to_path_buf()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(extract_capture(path, self.time_limit)?),
        };
        Ok(records.as_slice())
    }
}

// ─── Fingerprint construction ─────────────────────────────────────────────────

/// Build a version fingerprint from its captures: collect every payload per
/// shape, intersect per-capture shape sets into the common set, then compute
/// invariant byte positions for each common shape.
fn build_fingerprint(
    files: &[PathBuf],
    cache: &mut PacketCache,
    pool: &rayon::ThreadPool,
) -> Result<Fingerprint> {
    let mut files: Vec<PathBuf> = files.to_vec();
    files.sort();

    let mut entries: HashMap<PacketKey, FingerprintEntry> = HashMap::new();
    let mut common_keys: BTreeSet<PacketKey> = BTreeSet::new();

    for (i, path) in files.iter().enumerate() {
        info!("Extracting packets from {:?} ({}/{})", path, i + 1, files.len());
        let records = cache.records(path)?;

        let mut seen: BTreeSet<PacketKey> = BTreeSet::new();
        for rec in records {
            let key = rec.key();
            seen.insert(key.clone());
            let entry = entries.entry(key).or_default();
            if entry.payloads.is_empty() {
                entry.baseline = rec.payload.clone();
            }
            entry.payloads.insert(rec.payload.clone());
        }

        // A shape absent from the first capture can never become common.
        if i == 0 {
            common_keys = seen;
        } else {
            common_keys = common_keys.intersection(&seen).cloned().collect();
        }
    }

    // One task per common shape; results are merged by key strictly after the
    // join, so no state is shared between tasks.
    let computed: Vec<(PacketKey, BTreeSet<usize>)> = pool.install(|| {
        common_keys
            .par_iter()
            .filter_map(|key| {
                entries
                    .get(key)
                    .map(|e| (key.clone(), invariant_positions(&e.baseline, &e.payloads)))
            })
            .collect()
    });
    for (key, positions) in computed {
        if let Some(entry) = entries.get_mut(&key) {
            entry.invariant = Some(positions);
        }
    }

    info!(
        "Fingerprint built: {} packet shapes, {} common",
        entries.len(),
        common_keys.len()
    );
    Ok(Fingerprint { entries, common_keys })
}

// ─── Comparison ───────────────────────────────────────────────────────────────

/// Diff one capture against a fingerprint. Each packet becomes at most one
/// row: new when its shape was never fingerprinted, changed when it disagrees
/// with the baseline at an invariant position. Common shapes that never show
/// up are reported as missing afterwards.
fn compare_capture(
    fingerprint: &Fingerprint,
    path: &Path,
    cache: &mut PacketCache,
) -> Result<ComparisonResult> {
    let records = cache.records(path)?;
    let total_packets = records.len();

    // Shapes still expected; whatever survives the capture is missing.
    let mut remaining = fingerprint.common_keys.clone();
    let mut rows: Vec<ComparisonRow> = Vec::new();

    for rec in records {
        let key = rec.key();
        remaining.remove(&key);

        let entry = match fingerprint.entries.get(&key) {
            Some(entry) => entry,
            None => {
                rows.push(ComparisonRow {
                    number:              rec.number,
                    total_packets,
                    proto:               rec.proto.clone(),
                    length:              rec.length,
                    new_packet:          true,
                    missing_packet:      false,
                    payload:             rec.payload.clone(),
                    diff_indices:        Vec::new(),
                    fingerprint_indices: Vec::new(),
                });
                continue;
            }
        };

        // A known shape that did not recur in every fingerprint capture has
        // no invariant model and is never flagged.
        if !fingerprint.common_keys.contains(&key) {
            continue;
        }
        let invariant = match &entry.invariant {
            Some(positions) => positions,
            None => continue,
        };

        let diffs = restricted_disagreement(&entry.baseline, &rec.payload, invariant);
        if diffs.is_empty() {
            continue;
        }
        rows.push(ComparisonRow {
            number:              rec.number,
            total_packets,
            proto:               rec.proto.clone(),
            length:              rec.length,
            new_packet:          false,
            missing_packet:      false,
            payload:             rec.payload.clone(),
            diff_indices:        diffs,
            fingerprint_indices: invariant.iter().copied().collect(),
        });
    }

    for key in &remaining {
        let entry = match fingerprint.entries.get(key) {
            Some(entry) => entry,
            None => continue,
        };
        rows.push(ComparisonRow {
            number:              0,
            total_packets,
            proto:               key.0.clone(),
            length:              key.1,
            new_packet:          false,
            missing_packet:      true,
            payload:             entry.baseline.clone(),
            diff_indices:        Vec::new(),
            fingerprint_indices: Vec::new(),
        });
    }

    Ok(ComparisonResult { rows, total_packets })
}

// ─── Diff rendering ───────────────────────────────────────────────────────────

/// Combining long stroke overlay, rendered over each changed character.
const STRIKETHROUGH: char = '\u{0336}';
/// Braille blank, stands in for unchanged characters in the invisible view.
const BLANK: char = '\u{2800}';

/// Payload bytes as text, one character per byte.
fn latin1(payload: &[u8]) -> String {
    payload.iter().map(|&b| b as char).collect()
}

/// Human-readable diff view of a payload. The normal view strikes through
/// changed characters; the invisible view keeps only the changed characters
/// and blanks everything else.
fn diff_string(payload: &[u8], diff_indices: &[usize], invisible: bool) -> String {
    let marked: HashSet<usize> = diff_indices.iter().copied().collect();
    let mut out = String::with_capacity(payload.len() * 2);
    for (i, &b) in payload.iter().enumerate() {
        if marked.contains(&i) {
            out.push(b as char);
            if !invisible {
                out.push(STRIKETHROUGH);
            }
        } else if invisible {
            out.push(BLANK);
        } else {
            out.push(b as char);
        }
    }
    out
}

// ─── CSV output ───────────────────────────────────────────────────────────────

const CSV_COLUMNS: [&str; 11] = [
    "packet_number",
    "total_packets",
    "proto",
    "length",
    "new_packet",
    "missing_packet",
    "payload",
    "payload_diff",
    "payload_diff_invisible",
    "diff_indices",
    "fingerprint_indices",
];

fn format_indices(indices: &[usize]) -> String {
    let parts: Vec<String> = indices.iter().map(|i| i.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

/// One CSV row per comparison row. Index lists and diff renderings are only
/// filled for changed packets; new and missing rows leave them empty.
fn write_comparison_csv(result: &ComparisonResult, csv_path: &Path) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new()
        .from_path(csv_path)
        .with_context(|| format!("Cannot create {:?}", csv_path))?;
    wtr.write_record(CSV_COLUMNS)?;

    for row in &result.rows {
        let changed = !row.new_packet && !row.missing_packet;
        let (payload_diff, payload_diff_invisible, diff_indices, fingerprint_indices) = if changed {
            (
                diff_string(&row.payload, &row.diff_indices, false),
                diff_string(&row.payload, &row.diff_indices, true),
                format_indices(&row.diff_indices),
                format_indices(&row.fingerprint_indices),
            )
        } else {
            (String::new(), String::new(), String::new(), String::new())
        };

        wtr.write_record(&[
            row.number.to_string(),
            row.total_packets.to_string(),
            row.proto.clone(),
            row.length.to_string(),
            row.new_packet.to_string(),
            row.missing_packet.to_string(),
            latin1(&row.payload),
            payload_diff,
            payload_diff_invisible,
            diff_indices,
            fingerprint_indices,
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

// ─── Filtered pcap output ─────────────────────────────────────────────────────

fn write_global_header(w: &mut impl Write, hdr: &PcapHeader) -> Result<()> {
    w.write_all(&0xa1b2c3d4u32.to_le_bytes())?;
    w.write_all(&hdr.version_major.to_le_bytes())?;
    w.write_all(&hdr.version_minor.to_le_bytes())?;
    w.write_all(&hdr.thiszone.to_le_bytes())?;
    w.write_all(&hdr.sigfigs.to_le_bytes())?;
    w.write_all(&hdr.snaplen.to_le_bytes())?;
    w.write_all(&(hdr.network.0 as u32).to_le_bytes())?;
    Ok(())
}

fn write_packet(w: &mut impl Write, ts_sec: u32, ts_usec: u32, data: &[u8]) -> Result<()> {
    let len = data.len() as u32;
    w.write_all(&ts_sec.to_le_bytes())?;
    w.write_all(&ts_usec.to_le_bytes())?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(data)?;
    Ok(())
}

/// Copy the frames whose 1-based numbers are in `keep` into a new legacy
/// pcap, preserving the input's global header and frame timestamps.
fn write_filtered_pcap(input: &Path, output: &Path, keep: &HashSet<u64>) -> Result<()> {
    let file = File::open(input).with_context(|| format!("Cannot open {:?}", input))?;
    let out_file = File::create(output).with_context(|| format!("Cannot create {:?}", output))?;
    let mut writer = BufWriter::new(out_file);
    let mut reader = LegacyPcapReader::new(65536, BufReader::new(file))
        .with_context(|| format!("Not a valid legacy pcap file: {:?}", input))?;

    let mut header_written = false;
    let mut frame_num: u64 = 0;

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                let frame: Option<(u32, u32, Vec<u8>)> = match block {
                    PcapBlockOwned::LegacyHeader(ref hdr) => {
                        if !header_written {
                            write_global_header(&mut writer, hdr)?;
                            header_written = true;
                        }
                        None
                    }
                    PcapBlockOwned::Legacy(ref pkt) => {
                        frame_num += 1;
                        if keep.contains(&frame_num) {
                            Some((pkt.ts_sec, pkt.ts_usec, pkt.data.to_vec()))
                        } else {
                            None
                        }
                    }
                    PcapBlockOwned::NG(_) => {
                        warn!("pcapng block in {:?} – only legacy pcap supported", input);
                        None
                    }
                };
                drop(block);
                reader.consume(offset);

                if let Some((ts_sec, ts_usec, data)) = frame {
                    write_packet(&mut writer, ts_sec, ts_usec, &data)?;
                }
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete) => {
                if let Err(e) = reader.refill() {
                    return Err(anyhow::anyhow!("refill error in {:?}: {:?}", input, e));
                }
            }
            Err(e) => return Err(anyhow::anyhow!("pcap parse error in {:?}: {:?}", input, e)),
        }
    }

    writer.flush()?;
    Ok(())
}

// ─── File selection ───────────────────────────────────────────────────────────

struct SelectedFiles {
    fingerprint_files: Vec<PathBuf>,
    test_files:        Vec<PathBuf>,
    result_dir:        PathBuf,
}

/// Partition a version's captures: half (rounded down) of the fingerprint
/// version's files are held out for testing, and every test version
/// (including the fingerprint version itself) contributes its first
/// `test_amount` files for comparison.
fn choose_files(
    pcap_dir: &Path,
    fingerprint_version: &str,
    test_versions: &[String],
) -> Result<SelectedFiles> {
    let app_name = pcap_dir
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .split('-')
        .next()
        .unwrap_or("")
        .to_string();

    let mut names: Vec<String> = fs::read_dir(pcap_dir)
        .with_context(|| format!("Cannot list {:?}", pcap_dir))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with(&app_name) && name.ends_with(".pcap"))
        .collect();
    names.sort();

    let mut fingerprint_names: Vec<String> = names
        .iter()
        .filter(|n| n.contains(fingerprint_version))
        .cloned()
        .collect();
    let test_amount = fingerprint_names.len() / 2;

    let mut test_names: Vec<String> = Vec::new();
    for version in test_versions {
        let version_names: Vec<&String> = names
            .iter()
            .filter(|n| n.contains(version.as_str()))
            .collect();
        for name in version_names.iter().take(test_amount) {
            test_names.push((*name).clone());
        }
        // Comparing a capture that also fed the fingerprint would be
        // misleading; hold the test prefix out of the fingerprint set.
        if version == fingerprint_version {
            for name in version_names.iter().take(test_amount) {
                fingerprint_names.retain(|n| n != *name);
            }
        }
    }

    let result_dir = pcap_dir.join("fingerprint_comparison");
    fs::create_dir_all(&result_dir)
        .with_context(|| format!("Cannot create {:?}", result_dir))?;

    Ok(SelectedFiles {
        fingerprint_files: fingerprint_names.iter().map(|n| pcap_dir.join(n)).collect(),
        test_files:        test_names.iter().map(|n| pcap_dir.join(n)).collect(),
        result_dir,
    })
}

/// Version label for output naming, from a capture named
/// `{app}_{version}_{run}.pcap`. Names outside the convention fall back to
/// the whole stem.
fn compared_version_label(path: &Path) -> String {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("capture");
    let tokens: Vec<&str> = stem.split('_').collect();
    if tokens.len() >= 3 {
        format!("{}_{}", tokens[1], tokens[2])
    } else {
        warn!("Capture name {:?} does not match app_version_run, using full stem", stem);
        stem.to_string()
    }
}

// ─── Main ─────────────────────────────────────────────────────────────────────

fn run_comparison(
    fingerprint: &Fingerprint,
    fingerprint_version: &str,
    pcap_file: &Path,
    result_dir: &Path,
    cache: &mut PacketCache,
    stats: &mut RunStats,
) -> Result<()> {
    info!("Comparing {:?} to fingerprint version {}", pcap_file, fingerprint_version);
    let result = compare_capture(fingerprint, pcap_file, cache)?;

    for row in &result.rows {
        if row.new_packet {
            stats.new_rows += 1;
        } else if row.missing_packet {
            stats.missing_rows += 1;
        } else {
            stats.changed_rows += 1;
        }
    }

    let base = format!(
        "{}_to_{}",
        fingerprint_version,
        compared_version_label(pcap_file)
    );

    let csv_path = result_dir.join(format!("{base}.csv"));
    write_comparison_csv(&result, &csv_path)?;
    stats.csv_files_written += 1;
    info!(
        "Wrote {} diff rows ({} packets compared) → {:?}",
        result.rows.len(),
        result.total_packets,
        csv_path
    );

    let keep = result.packet_numbers();
    let pcap_path = result_dir.join(format!("{base}.pcap"));
    write_filtered_pcap(pcap_file, &pcap_path, &keep)?;
    stats.pcap_files_written += 1;
    info!("Wrote filtered capture ({} packets) → {:?}", keep.len(), pcap_path);

    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt().with_max_level(log_level).with_target(false).with_writer(std::io::stderr).init();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| args.pcap_dir.join("config.json"));
    let config = load_config(&config_path)?;
    info!(
        "Loaded {:?}: application '{}', {} job(s)",
        config_path,
        config.name,
        config.jobs.len()
    );
    if let Some(ref label) = config.label {
        info!("Label: {}", label);
    }

    let versions: Vec<String> = config.jobs.iter().map(|j| j.version.clone()).collect();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(args.threads)
        .build()
        .context("Cannot build worker pool")?;
    let mut cache = PacketCache::new(args.time_limit);
    let mut stats = RunStats::default();
    let mut result_dir = args.pcap_dir.join("fingerprint_comparison");

    for job in &config.jobs {
        info!(
            "Fingerprinting version {} and comparing against versions {:?}",
            job.version, versions
        );
        let selected = choose_files(&args.pcap_dir, &job.version, &versions)?;
        if selected.fingerprint_files.is_empty() {
            warn!(
                "No fingerprint captures for version {} – every compared packet will look new",
                job.version
            );
        }
        result_dir = selected.result_dir.clone();

        let fingerprint = build_fingerprint(&selected.fingerprint_files, &mut cache, &pool)?;
        stats.fingerprints_built += 1;
        stats.common_keys_total += fingerprint.common_keys.len() as u64;

        // Comparisons are independent of each other; one bad capture must not
        // sink the rest of the batch.
        for test_file in &selected.test_files {
            match run_comparison(
                &fingerprint,
                &job.version,
                test_file,
                &selected.result_dir,
                &mut cache,
                &mut stats,
            ) {
                Ok(()) => stats.comparisons_run += 1,
                Err(e) => {
                    stats.comparisons_failed += 1;
                    warn!("Comparison of {:?} failed: {:#}", test_file, e);
                }
            }
        }
    }

    stats.captures_decoded = cache.map.len() as u64;
    stats.packets_decoded = cache.map.values().map(|v| v.len() as u64).sum();

    if args.report {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("=== Fingerprint Comparison Summary ===");
        println!("Captures decoded:        {}", stats.captures_decoded);
        println!("Packets decoded:         {}", stats.packets_decoded);
        println!("Fingerprints built:      {}", stats.fingerprints_built);
        println!("Common shapes (total):   {}", stats.common_keys_total);
        println!("Comparisons run:         {}", stats.comparisons_run);
        println!("Comparisons failed:      {}", stats.comparisons_failed);
        println!("─────────────────────────────────────────");
        println!("Changed packet rows:     {}", stats.changed_rows);
        println!("New packet rows:         {}", stats.new_rows);
        println!("Missing packet rows:     {}", stats.missing_rows);
        println!("CSV files written:       {}", stats.csv_files_written);
        println!("Filtered pcaps written:  {}", stats.pcap_files_written);
        println!("Results dir:             {}", result_dir.display());
    }

    Ok(())
}

// ─── Tests ────────────────────────────────────────────────────────────────────
