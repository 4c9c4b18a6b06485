//! Snippet downloads.
//!
//! Streams a song's preview snippet from the CDN into `downloads_dir`, then
//! tags it with the song's metadata (and album cover when there is one).

use anyhow::{Context, Result};
use futures_util::StreamExt;
use listen_proto::types::Song;
use lofty::config::WriteOptions;
use lofty::picture::{MimeType, Picture, PictureType};
use lofty::prelude::*;
use lofty::probe::Probe;
use lofty::tag::{ItemKey, Tag};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Downloader {
    http: reqwest::Client,
    dir: PathBuf,
    romaji_first: bool,
    separator: String,
}

impl Downloader {
    pub fn new(dir: PathBuf, romaji_first: bool, separator: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            dir,
            romaji_first,
            separator,
        }
    }

    /// Download and tag `song`'s snippet.  Returns the written file.
    pub async fn download(&self, song: &Song) -> Result<PathBuf> {
        let url = song
            .snippet_url()
            .with_context(|| format!("song {} has no snippet", song.id))?;
        self.download_from(song, &url).await
    }

    async fn download_from(&self, song: &Song, url: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {:?}", self.dir))?;

        let path = self.dir.join(file_name(song, url, self.romaji_first, &self.separator));
        let partial = path.with_extension("part");
        info!("download: {} → {:?}", url, path);

        let response = self
            .http
            .get(url)
            .send()
            .await
            .context("Failed to fetch snippet")?;
        if !response.status().is_success() {
            anyhow::bail!("CDN returned status: {}", response.status());
        }

        let mut file = tokio::fs::File::create(&partial)
            .await
            .with_context(|| format!("Failed to create {:?}", partial))?;
        let mut stream = response.bytes_stream();
        let mut written = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Snippet download interrupted")?;
            file.write_all(&chunk).await?;
            written += chunk.len();
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&partial, &path).await?;
        debug!("download: wrote {} bytes", written);

        let cover = match song.album_image() {
            Some(cover_url) => self.fetch_cover(&cover_url).await,
            None => None,
        };
        if let Err(e) = write_tags(&path, song, self.romaji_first, &self.separator, cover).await {
            warn!("download: could not tag {:?}: {:#}", path, e);
        }
        Ok(path)
    }

    async fn fetch_cover(&self, url: &str) -> Option<Vec<u8>> {
        let response = self.http.get(url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.bytes().await.ok().map(|b| b.to_vec())
    }
}

/// `Artist - Title.ext`, with characters that are unsafe in file names
/// replaced.
pub fn file_name(song: &Song, url: &str, romaji_first: bool, separator: &str) -> String {
    let ext = Path::new(url)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 4)
        .unwrap_or("ogg");
    let title = song
        .format_title(romaji_first)
        .unwrap_or_else(|| song.id.to_string());
    let stem = match song.format_artists(romaji_first, separator) {
        Some(artists) => format!("{} - {}", artists, title),
        None => title,
    };
    format!("{}.{}", sanitize(&stem), ext)
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.');
    if trimmed.is_empty() {
        "snippet".to_string()
    } else {
        trimmed.to_string()
    }
}

async fn write_tags(
    path: &Path,
    song: &Song,
    romaji_first: bool,
    separator: &str,
    cover: Option<Vec<u8>>,
) -> Result<()> {
    let path = path.to_path_buf();
    let title = song.format_title(romaji_first);
    let artists = song.format_artists(romaji_first, separator);
    let album = song.format_album(romaji_first);
    let source = song.format_source(romaji_first);

    tokio::task::spawn_blocking(move || -> Result<()> {
        let tagged_file = Probe::open(&path)?
            .read()
            .context("Failed to read audio file")?;
        let mut tag = tagged_file
            .primary_tag()
            .cloned()
            .unwrap_or_else(|| Tag::new(tagged_file.primary_tag_type()));

        if let Some(title) = title {
            tag.insert_text(ItemKey::TrackTitle, title);
        }
        if let Some(artists) = artists {
            tag.insert_text(ItemKey::TrackArtist, artists);
        }
        if let Some(album) = album {
            tag.insert_text(ItemKey::AlbumTitle, album);
        }
        if let Some(source) = source {
            tag.insert_text(ItemKey::Comment, source);
        }
        if let Some(data) = cover {
            tag.push_picture(Picture::new_unchecked(
                PictureType::CoverFront,
                Some(MimeType::Jpeg),
                None,
                data,
            ));
        }
        tag.save_to_path(&path, WriteOptions::default())
            .context("Failed to save metadata to file")?;
        Ok(())
    })
    .await
    .context("Metadata writing task failed")??;
    Ok(())
}
