//! Integration tests for core domain models.
//!
//! Covers the wire forms of tokens, format masks and jobs, and the merge
//! rules of cached artifact entries.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use serde_json::json;
use tankobon_core::{
    ArtifactEntry, ArtifactHandle, ContentRef, ItemRef, Job, OutputFormat, OutputFormats,
    RecipientId, SeriesRef, TestClock, Token, TokenRegistry,
};

fn registry() -> TokenRegistry<String> {
    TokenRegistry::new(8, Duration::from_secs(60), Arc::new(TestClock::new()))
}

fn item() -> ItemRef {
    ItemRef::new(
        "https://manga.example/series/1/chapter/3",
        "Chapter 3",
        SeriesRef::new("https://manga.example/series/1", "Series 1"),
    )
}

#[test]
fn token_text_and_json_forms_agree() -> Result<()> {
    let registry = registry();
    registry.insert("a".to_string());
    let token = registry.insert("b".to_string());

    let text = token.to_string();
    assert_eq!(text.parse::<Token>()?, token);

    let encoded = serde_json::to_value(token)?;
    assert_eq!(encoded, json!(text));
    assert_eq!(serde_json::from_value::<Token>(encoded)?, token);
    Ok(())
}

#[test]
fn malformed_tokens_are_rejected() {
    for bad in ["", "7", "1-", "-1", "zz-1", "1-2-3", "100000000-0"] {
        assert!(bad.parse::<Token>().is_err(), "{bad:?} parsed");
        assert!(serde_json::from_value::<Token>(json!(bad)).is_err(), "{bad:?} deserialized");
    }
    assert!(serde_json::from_value::<Token>(json!(12)).is_err());
}

#[test]
fn format_mask_serializes_as_bits() -> Result<()> {
    let mask = OutputFormats::DOCUMENT | OutputFormats::WEB_LINK;

    assert_eq!(serde_json::to_value(mask)?, json!(5));
    assert_eq!(serde_json::from_value::<OutputFormats>(json!(5))?, mask);
    assert_eq!(serde_json::to_value(OutputFormat::WebLink)?, json!("web_link"));
    assert_eq!(
        serde_json::from_value::<OutputFormat>(json!("archive"))?,
        OutputFormat::Archive
    );
    Ok(())
}

#[test]
fn toggling_every_format_off_leaves_an_empty_mask() {
    let mask = OutputFormat::ALL
        .into_iter()
        .fold(OutputFormats::default(), |mask, format| mask.toggle(format.flag()));

    assert!(mask.is_empty());
    assert_eq!(mask.iter().count(), 0);
    assert_eq!(mask.toggle(OutputFormats::ARCHIVE).iter().collect::<Vec<_>>(), [
        OutputFormat::Archive
    ]);
}

#[test]
fn mask_iterates_in_delivery_order() {
    let mask: OutputFormats = [OutputFormat::WebLink, OutputFormat::Document].into_iter().collect();

    assert_eq!(mask.iter().collect::<Vec<_>>(), [OutputFormat::Document, OutputFormat::WebLink]);
    assert_eq!(OutputFormats::ALL.difference(mask), OutputFormats::ARCHIVE);
}

#[test]
fn job_survives_json() -> Result<()> {
    let job = Job::new(RecipientId(42), item());

    let decoded: Job = serde_json::from_str(&serde_json::to_string(&job)?)?;

    assert_eq!(decoded, job);
    assert_eq!(decoded.content_ref(), &ContentRef::new("https://manga.example/series/1/chapter/3"));
    Ok(())
}

#[test]
fn merged_entry_keeps_every_produced_format() {
    let content_ref = ContentRef::new("https://manga.example/series/1/chapter/3");

    let mut stored = ArtifactEntry::new(content_ref.clone());
    stored.set_handle(OutputFormat::Document, ArtifactHandle::new("doc-1"));

    let mut fresh = ArtifactEntry::new(content_ref);
    fresh.set_handle(OutputFormat::Archive, ArtifactHandle::new("zip-1"));
    fresh.web_link = Some("https://pages.example/ch3".to_string());

    stored.merge(fresh);

    assert_eq!(stored.formats(), OutputFormats::ALL);
    assert_eq!(stored.handle(OutputFormat::Document), Some(&ArtifactHandle::new("doc-1")));
    assert_eq!(stored.handle(OutputFormat::Archive), Some(&ArtifactHandle::new("zip-1")));
    assert_eq!(stored.handle(OutputFormat::WebLink), None);
}

#[test]
fn web_link_is_never_a_file_handle() {
    let mut entry = ArtifactEntry::new(ContentRef::new("https://manga.example/c/1"));
    entry.set_handle(OutputFormat::WebLink, ArtifactHandle::new("ignored"));

    assert!(entry.is_empty());
    assert!(!OutputFormat::WebLink.is_file());
}
