//! End-to-end indexing and search: scan real files, extract their content,
//! query through the search engine.

use std::fs;
use std::io::Write;
use std::sync::Arc;

use fv_core::search::SearchQuery;
use fv_core::types::TagSource;
use fv_core::{AppConfig, Core, SortBy, Visibility};
use pretty_assertions::assert_eq;
use sqlx::Row;

async fn open_core(dir: &std::path::Path) -> Core {
    let config = AppConfig::default_with_dir(dir.to_path_buf());
    let vault = Arc::new(fv_core::vault::SecretVault::in_memory());
    Core::open_with_vault(config, vault).await.unwrap()
}

fn write_pptx(path: &std::path::Path, slide_texts: &[&str]) {
    let file = fs::File::create(path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    writer
        .start_file("ppt/presentation.xml", options)
        .unwrap();
    writer.write_all(b"<p:presentation/>").unwrap();
    for (i, text) in slide_texts.iter().enumerate() {
        writer
            .start_file(format!("ppt/slides/slide{}.xml", i + 1), options)
            .unwrap();
        writer
            .write_all(
                format!(
                    r#"<p:sld xmlns:a="ns"><a:p><a:r><a:t>{text}</a:t></a:r></a:p></p:sld>"#
                )
                .as_bytes(),
            )
            .unwrap();
    }
    writer.finish().unwrap();
}

#[tokio::test]
async fn scan_and_search_round_trip() {
    let data_dir = tempfile::tempdir().unwrap();
    let docs = tempfile::tempdir().unwrap();

    fs::write(docs.path().join("readme.txt"), "Hello FamilyVault world").unwrap();
    write_pptx(
        &docs.path().join("slide.pptx"),
        &["Quarterly review Q2", "Roadmap"],
    );

    let core = open_core(data_dir.path()).await;
    let folder_id = core
        .index
        .add_folder(docs.path(), "docs", Visibility::Family)
        .await
        .unwrap();
    core.index.scan_folder(folder_id, None).await.unwrap();

    core.content.start(None).await.unwrap();
    core.content.wait_until_idle().await;
    let status = core.content.status();
    assert_eq!(status.failed, 0);
    assert_eq!(status.processed, 2);

    // Exactly one hit, the deck, with the matching snippet.
    let results = core
        .search
        .search(&SearchQuery::text("quarterly"))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].file.name, "slide.pptx");
    assert!(results[0]
        .snippet
        .as_deref()
        .unwrap()
        .contains("Quarterly review"));

    // The other file is reachable by its own words.
    let results = core
        .search
        .search(&SearchQuery::text("familyvault"))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].file.name, "readme.txt");

    assert_eq!(
        core.search.count(&SearchQuery::text("quarterly")).await.unwrap(),
        1
    );

    let suggestions = core.search.suggest("read", 5).await.unwrap();
    assert_eq!(suggestions, vec!["readme.txt".to_string()]);

    core.shutdown().await.unwrap();
}

#[tokio::test]
async fn rescan_without_changes_is_a_no_op() {
    let data_dir = tempfile::tempdir().unwrap();
    let docs = tempfile::tempdir().unwrap();
    fs::write(docs.path().join("stable.txt"), "unchanging bytes").unwrap();

    let core = open_core(data_dir.path()).await;
    let folder_id = core
        .index
        .add_folder(docs.path(), "docs", Visibility::Family)
        .await
        .unwrap();
    core.index.scan_folder(folder_id, None).await.unwrap();

    let before = core.index.get_by_folder(folder_id, 10, 0).await.unwrap();
    let summary = core.index.scan_folder(folder_id, None).await.unwrap();
    assert_eq!(summary.added, 0);
    assert_eq!(summary.updated, 0);
    assert_eq!(summary.skipped, 1);

    // No row-versioned column moved.
    let after = core.index.get_by_folder(folder_id, 10, 0).await.unwrap();
    assert_eq!(before[0].sync_version, after[0].sync_version);
    assert_eq!(before[0].modified_at, after[0].modified_at);

    core.shutdown().await.unwrap();
}

#[tokio::test]
async fn fts_rows_mirror_files_and_content_presence() {
    let data_dir = tempfile::tempdir().unwrap();
    let docs = tempfile::tempdir().unwrap();
    fs::write(docs.path().join("a.txt"), "alpha beta").unwrap();
    fs::write(docs.path().join("b.bin"), [0u8, 1, 2, 3]).unwrap();

    let core = open_core(data_dir.path()).await;
    let folder_id = core
        .index
        .add_folder(docs.path(), "docs", Visibility::Family)
        .await
        .unwrap();
    core.index.scan_folder(folder_id, None).await.unwrap();
    core.content.start(None).await.unwrap();
    core.content.wait_until_idle().await;

    // Every file row has an FTS row with matching name/path, and the content
    // column is non-empty exactly when a file_contents row exists.
    let rows = core
        .db
        .query_all(
            "SELECT f.id, f.name,
                    ft.name AS fts_name, ft.relative_path AS fts_path,
                    LENGTH(ft.content) AS content_len,
                    (SELECT COUNT(*) FROM file_contents c WHERE c.file_id = f.id) AS has_content
             FROM files f JOIN files_fts ft ON ft.rowid = f.id",
            &[],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    for row in rows {
        let name: String = row.try_get("name").unwrap();
        let fts_name: String = row.try_get("fts_name").unwrap();
        assert_eq!(name, fts_name);
        let content_len: i64 = row.try_get("content_len").unwrap();
        let has_content: i64 = row.try_get("has_content").unwrap();
        assert_eq!(content_len > 0, has_content > 0);
    }

    core.shutdown().await.unwrap();
}

#[tokio::test]
async fn filters_compose_with_tags_and_sort() {
    let data_dir = tempfile::tempdir().unwrap();
    let docs = tempfile::tempdir().unwrap();
    fs::write(docs.path().join("big.txt"), "x".repeat(5000)).unwrap();
    fs::write(docs.path().join("small.txt"), "y").unwrap();

    let core = open_core(data_dir.path()).await;
    let folder_id = core
        .index
        .add_folder(docs.path(), "docs", Visibility::Family)
        .await
        .unwrap();
    core.index.scan_folder(folder_id, None).await.unwrap();

    let files = core.index.get_by_folder(folder_id, 10, 0).await.unwrap();
    let big = files.iter().find(|f| f.name == "big.txt").unwrap();
    core.tags.add(big.id, "Archive-Me", TagSource::User).await.unwrap();

    // Tag include filter narrows to the tagged file.
    let mut query = SearchQuery::default();
    query.include_tags = vec!["archive-me".into()];
    let results = core.search.search(&query).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].file.name, "big.txt");

    // Tag exclusion removes it.
    let mut query = SearchQuery::default();
    query.exclude_tags = vec!["archive-me".into()];
    let results = core.search.search(&query).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].file.name, "small.txt");

    // Size sort descending puts the big file first.
    let mut query = SearchQuery::default();
    query.sort_by = SortBy::Size;
    query.sort_asc = false;
    let results = core.search.search(&query).await.unwrap();
    assert_eq!(results[0].file.name, "big.txt");

    // Size range filter.
    let mut query = SearchQuery::default();
    query.size_range = Some(fv_core::search::SizeRange {
        min: Some(1000),
        max: None,
    });
    assert_eq!(core.search.count(&query).await.unwrap(), 1);

    core.shutdown().await.unwrap();
}

#[tokio::test]
async fn duplicate_detection_over_real_files() {
    let data_dir = tempfile::tempdir().unwrap();
    let docs = tempfile::tempdir().unwrap();
    let payload = vec![7u8; 1024];
    fs::create_dir_all(docs.path().join("nested")).unwrap();
    fs::write(docs.path().join("photo.jpg"), &payload).unwrap();
    fs::write(docs.path().join("photo-copy.jpg"), &payload).unwrap();
    fs::write(docs.path().join("nested/photo-again.jpg"), &payload).unwrap();
    fs::write(docs.path().join("unique.jpg"), b"different").unwrap();

    let core = open_core(data_dir.path()).await;
    let folder_id = core
        .index
        .add_folder(docs.path(), "photos", Visibility::Family)
        .await
        .unwrap();
    core.index.scan_folder(folder_id, None).await.unwrap();
    core.duplicates.compute_checksums(None).await.unwrap();

    let groups = core.duplicates.find().await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].local_files.len(), 3);
    assert_eq!(groups[0].potential_savings(), 2 * payload.len() as i64);

    core.shutdown().await.unwrap();
}
