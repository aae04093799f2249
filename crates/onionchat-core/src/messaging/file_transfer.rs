//! File transfer functionality.
//!
//! Outgoing files are packed into a single bundle together with the JSON
//! models that describe them, then served in fixed-size chunks that the
//! receiver pulls with a sliding window. The receiver writes chunks at
//! their offsets, verifies the SHA-256 of the whole bundle and unpacks it.
//!
//! Bundle layout: `manifest_len (u32 BE) | manifest (bincode) | file bytes`.

use crate::error::{Error, Result};
use crate::identity::PublicKey;
use crate::protocol::{FileOfferPayload, MAX_PAYLOAD_SIZE};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

/// Default chunk size (32KB).
pub const DEFAULT_CHUNK_SIZE: u32 = 32 * 1024;

/// Default number of chunk requests in flight.
pub const DEFAULT_CHUNK_WINDOW: u32 = 8;

/// Largest chunk that still fits a packet with its framing.
pub const MAX_CHUNK_SIZE: u32 = (MAX_PAYLOAD_SIZE - 1024) as u32;

/// Most chunks an incoming transfer may be split into.
pub const MAX_TRANSFER_CHUNKS: u32 = 1 << 20;

/// Default cap on the size of an incoming bundle (512 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 512 * 1024 * 1024;

/// Largest manifest accepted when unpacking.
const MAX_MANIFEST_SIZE: u32 = 16 * 1024 * 1024;

/// Name of the unpacked model file.
pub const MODEL_FILE_NAME: &str = "model.json";

/// Name of the unpacked recording model file.
pub const RECORD_MODEL_FILE_NAME: &str = "record_model.json";

/// One file inside a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleEntry {
    /// File name, sanitized on unpack.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

/// Bundle header. Models are stored as JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    /// JSON model.
    pub model: String,
    /// Optional JSON recording model.
    pub record_model: Option<String>,
    /// Hex public key of the bundle's owner.
    pub owner_public_key: String,
    /// Files in the order their bytes follow the manifest.
    pub files: Vec<BundleEntry>,
}

/// A bundle written to disk, ready to offer.
#[derive(Debug, Clone)]
pub struct BuiltBundle {
    /// Location of the bundle.
    pub path: PathBuf,
    /// Name announced in the offer.
    pub file_name: String,
    /// Size in bytes.
    pub size: u64,
    /// SHA-256 of the whole bundle.
    pub sha256: [u8; 32],
}

/// Pack `files` and the models into a bundle under `temp_dir`.
pub async fn build_bundle(
    temp_dir: &Path,
    owner: &PublicKey,
    model: &serde_json::Value,
    record_model: Option<&serde_json::Value>,
    files: &[PathBuf],
) -> Result<BuiltBundle> {
    let mut entries = Vec::with_capacity(files.len());
    for path in files {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::Transfer(format!("cannot read {}: {}", path.display(), e)))?;
        if !metadata.is_file() {
            return Err(Error::Transfer(format!("{} is not a file", path.display())));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        entries.push(BundleEntry {
            name,
            size: metadata.len(),
        });
    }

    let manifest = BundleManifest {
        model: serde_json::to_string(model)?,
        record_model: record_model.map(serde_json::to_string).transpose()?,
        owner_public_key: owner.to_hex(),
        files: entries,
    };
    let manifest_bytes = bincode::serialize(&manifest)?;
    let manifest_len = u32::try_from(manifest_bytes.len())
        .map_err(|_| Error::Transfer("manifest too large".into()))?;

    tokio::fs::create_dir_all(temp_dir).await?;
    let file_name = format!("{}.bundle", uuid::Uuid::new_v4());
    let path = temp_dir.join(&file_name);
    let mut out = File::create(&path).await?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;

    let header = manifest_len.to_be_bytes();
    for part in [&header[..], &manifest_bytes[..]] {
        out.write_all(part).await?;
        hasher.update(part);
        size += part.len() as u64;
    }

    let mut buffer = vec![0u8; 8192];
    for (source, entry) in files.iter().zip(&manifest.files) {
        let mut input = File::open(source).await?;
        let mut copied = 0u64;
        loop {
            let n = input.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            out.write_all(&buffer[..n]).await?;
            hasher.update(&buffer[..n]);
            copied += n as u64;
        }
        if copied != entry.size {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(Error::Transfer(format!(
                "{} changed while bundling",
                source.display()
            )));
        }
        size += copied;
    }
    out.flush().await?;

    debug!(size = size, files = manifest.files.len(), "Bundle built");
    Ok(BuiltBundle {
        path,
        file_name,
        size,
        sha256: hasher.finalize().into(),
    })
}

/// Unpack a verified bundle into `dest`, which is created.
pub async fn unpack_bundle(bundle: &Path, dest: &Path) -> Result<BundleManifest> {
    let mut input = File::open(bundle).await?;

    let manifest_len = input.read_u32().await?;
    if manifest_len > MAX_MANIFEST_SIZE {
        return Err(Error::Transfer(format!("manifest of {} bytes", manifest_len)));
    }
    let mut manifest_bytes = vec![0u8; manifest_len as usize];
    input.read_exact(&mut manifest_bytes).await?;
    let manifest: BundleManifest = bincode::deserialize(&manifest_bytes)?;

    tokio::fs::create_dir_all(dest).await?;
    tokio::fs::write(dest.join(MODEL_FILE_NAME), manifest.model.as_bytes()).await?;
    if let Some(record_model) = &manifest.record_model {
        tokio::fs::write(dest.join(RECORD_MODEL_FILE_NAME), record_model.as_bytes()).await?;
    }

    let mut used = BTreeSet::new();
    for entry in &manifest.files {
        let name = unique_name(&mut used, sanitize_file_name(&entry.name));
        let mut out = File::create(dest.join(&name)).await?;
        let copied = tokio::io::copy(&mut (&mut input).take(entry.size), &mut out).await?;
        if copied != entry.size {
            return Err(Error::Transfer(format!("bundle truncated in {}", name)));
        }
        out.flush().await?;
    }

    let mut trailing = [0u8; 1];
    if input.read(&mut trailing).await? != 0 {
        return Err(Error::Transfer("trailing bytes after bundle".into()));
    }
    Ok(manifest)
}

/// Reduce a peer-supplied name to a safe single path component.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').trim().to_string();

    if cleaned.is_empty() {
        "file".to_string()
    } else if cleaned == MODEL_FILE_NAME || cleaned == RECORD_MODEL_FILE_NAME {
        format!("file_{}", cleaned)
    } else {
        cleaned
    }
}

fn unique_name(used: &mut BTreeSet<String>, name: String) -> String {
    let mut candidate = name.clone();
    let mut n = 1;
    while !used.insert(candidate.clone()) {
        candidate = format!("{}_{}", n, name);
        n += 1;
    }
    candidate
}

/// SHA-256 of a file.
pub async fn sha256_file(path: &Path) -> Result<[u8; 32]> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Percentage for `done` of `total`, 100 when `total` is zero.
fn percent(done: u32, total: u32) -> u8 {
    if total == 0 {
        return 100;
    }
    ((u64::from(done) * 100) / u64::from(total)) as u8
}

/// File transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Queued behind another transfer to the same friend.
    Pending,
    /// Offered and being served.
    Active,
}

/// Outgoing file transfer.
#[derive(Debug)]
pub struct OutgoingTransfer {
    /// Transfer ID.
    pub transfer_id: [u8; 16],
    /// Message id returned to the caller.
    pub message_id: i32,
    /// Recipient.
    pub recipient: PublicKey,
    /// The bundle on disk.
    pub bundle: BuiltBundle,
    /// Chunk size served.
    pub chunk_size: u32,
    /// Current state.
    pub state: TransferState,
    served: BTreeSet<u32>,
    last_progress: u8,
}

impl OutgoingTransfer {
    /// Create a transfer in state `Pending`.
    pub fn new(message_id: i32, recipient: PublicKey, bundle: BuiltBundle, chunk_size: u32) -> Self {
        Self {
            transfer_id: uuid::Uuid::new_v4().into_bytes(),
            message_id,
            recipient,
            bundle,
            chunk_size: chunk_size.max(1),
            state: TransferState::Pending,
            served: BTreeSet::new(),
            last_progress: 0,
        }
    }

    /// The offer announcing this transfer.
    pub fn offer(&self) -> FileOfferPayload {
        FileOfferPayload {
            transfer_id: self.transfer_id,
            message_id: self.message_id,
            file_name: self.bundle.file_name.clone(),
            size: self.bundle.size,
            sha256: self.bundle.sha256,
            chunk_size: self.chunk_size,
        }
    }

    /// Chunks covering the bundle.
    pub fn total_chunks(&self) -> u32 {
        self.offer().total_chunks().unwrap_or(u32::MAX)
    }

    /// Read chunk `index` from the bundle.
    pub async fn read_chunk(&self, index: u32) -> Result<Vec<u8>> {
        if index >= self.total_chunks() {
            return Err(Error::Protocol(format!("chunk {} out of range", index)));
        }
        let offset = u64::from(index) * u64::from(self.chunk_size);
        if offset >= self.bundle.size {
            return Err(Error::Protocol(format!("chunk {} out of range", index)));
        }
        let len = (self.bundle.size - offset).min(u64::from(self.chunk_size)) as usize;

        let mut file = File::open(&self.bundle.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut chunk = vec![0u8; len];
        file.read_exact(&mut chunk).await?;
        Ok(chunk)
    }

    /// Record a served chunk. Returns the new progress when it changed.
    ///
    /// Progress stays below 100 until the receiver confirms.
    pub fn record_served(&mut self, index: u32) -> Option<u8> {
        self.served.insert(index);
        let progress = percent(self.served.len() as u32, self.total_chunks()).min(99);
        if progress > self.last_progress {
            self.last_progress = progress;
            Some(progress)
        } else {
            None
        }
    }

    /// Remove the bundle from disk.
    pub async fn discard(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.bundle.path).await {
            debug!(error = %e, "Failed to remove bundle");
        }
    }
}

/// Incoming file transfer.
#[derive(Debug)]
pub struct IncomingTransfer {
    /// Transfer ID.
    pub transfer_id: [u8; 16],
    /// Sender.
    pub sender: PublicKey,
    /// The offer as received.
    pub offer: FileOfferPayload,
    /// Partial bundle location.
    pub part_path: PathBuf,
    file: File,
    received: Vec<bool>,
    received_count: u32,
    outstanding: BTreeSet<u32>,
    next_index: u32,
    last_progress: u8,
}

impl IncomingTransfer {
    /// Prepare to receive `offer` into `download_dir`.
    ///
    /// Offers larger than `max_size`, with a chunk size outside
    /// `1..=MAX_CHUNK_SIZE`, or split into more than [`MAX_TRANSFER_CHUNKS`]
    /// are refused before anything touches the disk.
    pub async fn create(
        download_dir: &Path,
        sender: PublicKey,
        offer: FileOfferPayload,
        max_size: u64,
    ) -> Result<Self> {
        if !(1..=MAX_CHUNK_SIZE).contains(&offer.chunk_size) {
            return Err(Error::Protocol(format!("chunk size {} out of range", offer.chunk_size)));
        }
        if offer.size > max_size {
            return Err(Error::Transfer(format!(
                "bundle of {} bytes exceeds the {} byte limit",
                offer.size, max_size
            )));
        }
        let total = offer
            .total_chunks()
            .filter(|total| *total <= MAX_TRANSFER_CHUNKS)
            .ok_or_else(|| Error::Protocol("too many chunks".into()))?;

        tokio::fs::create_dir_all(download_dir).await?;
        let part_path = download_dir.join(format!(".{}.part", hex::encode(offer.transfer_id)));
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&part_path)
            .await?;
        file.set_len(offer.size).await?;

        Ok(Self {
            transfer_id: offer.transfer_id,
            sender,
            part_path,
            file,
            received: vec![false; total as usize],
            received_count: 0,
            outstanding: BTreeSet::new(),
            next_index: 0,
            last_progress: 0,
            offer,
        })
    }

    /// Total chunks expected.
    pub fn total_chunks(&self) -> u32 {
        self.received.len() as u32
    }

    /// Chunk indexes to request now so that at most `window` are in flight.
    pub fn next_requests(&mut self, window: u32) -> Vec<u32> {
        let mut out = Vec::new();
        let total = self.total_chunks();
        while (self.outstanding.len() as u32) < window.max(1) && self.next_index < total {
            let index = self.next_index;
            self.next_index += 1;
            if !self.received[index as usize] {
                self.outstanding.insert(index);
                out.push(index);
            }
        }
        out
    }

    /// Forget in-flight requests; the sender re-offered after a reconnect.
    pub fn restart_requests(&mut self) {
        self.outstanding.clear();
        self.next_index = 0;
    }

    /// Write a chunk. Returns the new progress when it changed.
    pub async fn write_chunk(&mut self, index: u32, data: &[u8]) -> Result<Option<u8>> {
        let total = self.total_chunks();
        if index >= total {
            return Err(Error::Protocol(format!("chunk {} out of range", index)));
        }
        let offset = u64::from(index) * u64::from(self.offer.chunk_size);
        let expected = (self.offer.size - offset).min(u64::from(self.offer.chunk_size));
        if data.len() as u64 != expected {
            return Err(Error::Protocol(format!(
                "chunk {} has {} bytes, expected {}",
                index,
                data.len(),
                expected
            )));
        }

        self.outstanding.remove(&index);
        if self.received[index as usize] {
            return Ok(None);
        }

        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        self.received[index as usize] = true;
        self.received_count += 1;

        let progress = percent(self.received_count, total);
        if progress > self.last_progress {
            self.last_progress = progress;
            Ok(Some(progress))
        } else {
            Ok(None)
        }
    }

    /// Whether every chunk has arrived.
    pub fn is_complete(&self) -> bool {
        self.received_count == self.total_chunks()
    }

    /// Verify the bundle and unpack it under `download_dir/<transfer id>/`.
    ///
    /// The partial file is removed whether or not this succeeds.
    pub async fn finish(mut self, download_dir: &Path) -> Result<PathBuf> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);

        let result = async {
            let digest = sha256_file(&self.part_path).await?;
            if digest != self.offer.sha256 {
                return Err(Error::Transfer("bundle hash mismatch".into()));
            }
            let dest = download_dir.join(hex::encode(self.transfer_id));
            unpack_bundle(&self.part_path, &dest).await?;
            Ok(dest)
        }
        .await;

        let _ = tokio::fs::remove_file(&self.part_path).await;
        if let Ok(dest) = &result {
            info!(path = %dest.display(), "File bundle received");
        }
        result
    }

    /// Drop the partial file.
    pub async fn abandon(self) {
        let part_path = self.part_path.clone();
        drop(self);
        let _ = tokio::fs::remove_file(part_path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn sample_bundle(dir: &TempDir, payload: &[u8]) -> BuiltBundle {
        let source = dir.path().join("photo.jpg");
        tokio::fs::write(&source, payload).await.expect("write");
        let owner = PublicKey::from_bytes([5; 32]);
        let model = serde_json::json!({ "title": "holiday" });
        let record = serde_json::json!({ "duration": 3 });
        build_bundle(&dir.path().join("tmp"), &owner, &model, Some(&record), &[source])
            .await
            .expect("bundle")
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\x\\a b.txt"), "a b.txt");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
        assert_eq!(sanitize_file_name("na$me?.png"), "na_me_.png");
        assert_eq!(sanitize_file_name(""), "file");
        assert_eq!(sanitize_file_name(".."), "file");
        assert_eq!(sanitize_file_name("model.json"), "file_model.json");
    }

    #[test]
    fn test_unique_names() {
        let mut used = BTreeSet::new();
        assert_eq!(unique_name(&mut used, "a".into()), "a");
        assert_eq!(unique_name(&mut used, "a".into()), "1_a");
        assert_eq!(unique_name(&mut used, "a".into()), "2_a");
    }

    #[tokio::test]
    async fn test_bundle_unpacks_models_and_files() {
        let dir = TempDir::new().expect("tempdir");
        let bundle = sample_bundle(&dir, b"jpeg bytes").await;
        assert_eq!(sha256_file(&bundle.path).await.expect("hash"), bundle.sha256);

        let dest = dir.path().join("out");
        let manifest = unpack_bundle(&bundle.path, &dest).await.expect("unpack");
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.owner_public_key, "05".repeat(32));

        let model: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(dest.join(MODEL_FILE_NAME)).await.expect("model"))
                .expect("json");
        assert_eq!(model["title"], "holiday");
        assert!(dest.join(RECORD_MODEL_FILE_NAME).exists());
        assert_eq!(tokio::fs::read(dest.join("photo.jpg")).await.expect("file"), b"jpeg bytes");
    }

    #[tokio::test]
    async fn test_missing_source_fails() {
        let dir = TempDir::new().expect("tempdir");
        let result = build_bundle(
            dir.path(),
            &PublicKey::from_bytes([1; 32]),
            &serde_json::json!({}),
            None,
            &[dir.path().join("nope")],
        )
        .await;
        assert!(matches!(result, Err(Error::Transfer(_))));
    }

    #[tokio::test]
    async fn test_chunked_transfer_between_sides() {
        let dir = TempDir::new().expect("tempdir");
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let bundle = sample_bundle(&dir, &payload).await;

        let mut outgoing = OutgoingTransfer::new(7, PublicKey::from_bytes([2; 32]), bundle, 1024);
        let downloads = dir.path().join("downloads");
        let mut incoming = IncomingTransfer::create(&downloads, PublicKey::from_bytes([5; 32]), outgoing.offer(), DEFAULT_MAX_FILE_SIZE)
            .await
            .expect("incoming");
        assert_eq!(incoming.total_chunks(), outgoing.total_chunks());

        let mut last_sent = 0;
        let mut last_received = 0;
        loop {
            let requests = incoming.next_requests(3);
            if requests.is_empty() {
                break;
            }
            assert!(requests.len() <= 3);
            // Serve in reverse to exercise offset writes.
            for index in requests.into_iter().rev() {
                let data = outgoing.read_chunk(index).await.expect("chunk");
                if let Some(p) = outgoing.record_served(index) {
                    assert!(p > last_sent);
                    last_sent = p;
                }
                if let Some(p) = incoming.write_chunk(index, &data).await.expect("write") {
                    assert!(p > last_received);
                    last_received = p;
                }
            }
        }
        assert!(incoming.is_complete());
        assert_eq!(last_received, 100);
        assert_eq!(last_sent, 99);

        let dest = incoming.finish(&downloads).await.expect("finish");
        assert_eq!(tokio::fs::read(dest.join("photo.jpg")).await.expect("file"), payload);
        assert!(dest.ends_with(hex::encode(outgoing.transfer_id)));
    }

    #[tokio::test]
    async fn test_corrupt_bundle_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let bundle = sample_bundle(&dir, b"abc").await;
        let outgoing = OutgoingTransfer::new(1, PublicKey::from_bytes([2; 32]), bundle, DEFAULT_CHUNK_SIZE);
        let mut offer = outgoing.offer();
        offer.sha256[0] ^= 0xff;

        let downloads = dir.path().join("downloads");
        let mut incoming = IncomingTransfer::create(&downloads, PublicKey::from_bytes([5; 32]), offer, DEFAULT_MAX_FILE_SIZE)
            .await
            .expect("incoming");
        for index in incoming.next_requests(DEFAULT_CHUNK_WINDOW) {
            let data = outgoing.read_chunk(index).await.expect("chunk");
            incoming.write_chunk(index, &data).await.expect("write");
        }
        let part = incoming.part_path.clone();
        assert!(matches!(incoming.finish(&downloads).await, Err(Error::Transfer(_))));
        assert!(!part.exists());
    }

    #[tokio::test]
    async fn test_oversized_offers_refused() {
        let dir = TempDir::new().expect("tempdir");
        let downloads = dir.path().join("downloads");
        let offer = FileOfferPayload {
            transfer_id: [3; 16],
            message_id: 1,
            file_name: "bundle".into(),
            size: 4_000_000_000,
            sha256: [0; 32],
            chunk_size: 1,
        };
        let sender = PublicKey::from_bytes([5; 32]);

        let too_big = IncomingTransfer::create(&downloads, sender, offer.clone(), DEFAULT_MAX_FILE_SIZE).await;
        assert!(too_big.is_err());

        // Within the size limit but split into far too many chunks.
        let tiny_chunks = IncomingTransfer::create(&downloads, sender, offer.clone(), u64::MAX).await;
        assert!(matches!(tiny_chunks, Err(Error::Protocol(_))));

        for chunk_size in [0, MAX_CHUNK_SIZE + 1] {
            let offer = FileOfferPayload {
                size: 10,
                chunk_size,
                ..offer.clone()
            };
            let result = IncomingTransfer::create(&downloads, sender, offer, DEFAULT_MAX_FILE_SIZE).await;
            assert!(matches!(result, Err(Error::Protocol(_))));
        }

        // Nothing was written for any refused offer.
        assert!(!downloads.exists());
    }

    #[tokio::test]
    async fn test_bad_chunks_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let bundle = sample_bundle(&dir, b"abc").await;
        let outgoing = OutgoingTransfer::new(1, PublicKey::from_bytes([2; 32]), bundle, DEFAULT_CHUNK_SIZE);
        let mut incoming = IncomingTransfer::create(dir.path(), PublicKey::from_bytes([5; 32]), outgoing.offer(), DEFAULT_MAX_FILE_SIZE)
            .await
            .expect("incoming");

        assert!(incoming.write_chunk(5, b"x").await.is_err());
        assert!(incoming.write_chunk(0, b"short").await.is_err());
        assert!(outgoing.read_chunk(1).await.is_err());
    }
}
