use crate::app::task_runner::{Status, Task};
use crate::app::{AppError, CreateBookmark};
use crate::bookmarks::{BookmarkPatch, EnrichmentStatus, FolderFilter, ListQuery};
use crate::collections::{CollectionCreate, CollectionUpdate};
use crate::eid::Eid;
use crate::folders::{FolderCreate, FolderUpdate};
use crate::search::{SearchMode, SearchQuery};

use super::{create_app, create_running_app, wait_enriched, wait_until, ALICE, BOB};

fn create(url: &str) -> CreateBookmark {
    CreateBookmark {
        url: url.to_string(),
        ..Default::default()
    }
}

fn folder(name: &str) -> FolderCreate {
    FolderCreate {
        name: name.to_string(),
        ..Default::default()
    }
}

fn collection(name: &str) -> CollectionCreate {
    CollectionCreate {
        name: name.to_string(),
        ..Default::default()
    }
}

fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
    items
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn test_create_bookmark_is_idempotent_per_user() {
    let t = create_app(false);

    let (first, existed) = t
        .app
        .create_bookmark(ALICE, create("https://example.com/post"))
        .unwrap();
    assert!(!existed);
    assert_eq!(first.enrichment_status, EnrichmentStatus::Pending);
    assert_eq!(first.domain, "example.com");

    let (second, existed) = t
        .app
        .create_bookmark(ALICE, create("https://example.com/post"))
        .unwrap();
    assert!(existed);
    assert_eq!(first.id, second.id);

    // another user saving the same url gets their own row
    let (other, existed) = t
        .app
        .create_bookmark(BOB, create("https://example.com/post"))
        .unwrap();
    assert!(!existed);
    assert_ne!(other.id, first.id);
}

#[test]
fn test_create_bookmark_rejects_bad_urls() {
    let t = create_app(false);

    for url in ["", "   ", "not a url", "ftp://example.com/file"] {
        let err = t.app.create_bookmark(ALICE, create(url)).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)), "{url:?}: {err}");
    }
}

#[test]
fn test_bookmarks_are_scoped_to_their_owner() {
    let t = create_app(false);
    let (bmark, _) = t
        .app
        .create_bookmark(ALICE, create("https://example.com/private"))
        .unwrap();

    assert!(matches!(
        t.app.get_bookmark(BOB, &bmark.id),
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        t.app.delete_bookmark(BOB, &bmark.id),
        Err(AppError::NotFound(_))
    ));
    assert_eq!(t.app.list_bookmarks(BOB, &ListQuery::default()).total, 0);
    assert_eq!(t.app.list_bookmarks(ALICE, &ListQuery::default()).total, 1);
}

#[test]
fn test_enrichment_completes_in_background() {
    let t = create_running_app(false);
    let (bmark, _) = t
        .app
        .create_bookmark(ALICE, create("https://blog.example.com/ownership"))
        .unwrap();

    let done = wait_enriched(&t.app, ALICE, &bmark.id);
    assert_eq!(done.enrichment_status, EnrichmentStatus::Completed);
    assert_eq!(done.enrichment_error, None);
    assert_eq!(
        done.ai_summary.as_deref(),
        Some("Summary: Article body for https://blog.example.com/ownership")
    );
    assert_eq!(done.auto_tags, vec!["stub".to_string()]);
    assert_eq!(done.content_type.as_deref(), Some("article"));
    assert!(done.thumbnail_url.is_some());
    assert_eq!(t.extractor.calls(), 1);
}

#[test]
fn test_description_replaces_extraction() {
    let t = create_running_app(false);
    let (bmark, _) = t
        .app
        .create_bookmark(
            ALICE,
            CreateBookmark {
                url: "https://example.com/paywalled".to_string(),
                description: Some("my own summary of the article".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

    let done = wait_enriched(&t.app, ALICE, &bmark.id);
    assert_eq!(done.enrichment_status, EnrichmentStatus::Completed);
    assert_eq!(
        done.ai_summary.as_deref(),
        Some("Summary: my own summary of the article")
    );
    assert_eq!(t.extractor.calls(), 0);
}

#[test]
fn test_failed_enrichment_records_error_and_can_retry() {
    let t = create_running_app(false);
    let (bmark, _) = t
        .app
        .create_bookmark(ALICE, create("https://broken.example.com/page"))
        .unwrap();

    let failed = wait_enriched(&t.app, ALICE, &bmark.id);
    assert_eq!(failed.enrichment_status, EnrichmentStatus::Failed);
    assert!(failed
        .enrichment_error
        .as_deref()
        .unwrap_or_default()
        .contains("connection refused"));

    let reset = t.app.retry_enrichment(ALICE, &bmark.id).unwrap();
    assert_eq!(reset.enrichment_status, EnrichmentStatus::Pending);
    assert_eq!(reset.enrichment_error, None);

    wait_until("second attempt", || (t.extractor.calls() >= 2).then_some(()));
    let again = wait_enriched(&t.app, ALICE, &bmark.id);
    assert_eq!(again.enrichment_status, EnrichmentStatus::Failed);
}

#[test]
fn test_llm_failure_keeps_page_media() {
    let t = create_running_app(false);
    let (bmark, _) = t
        .app
        .create_bookmark(
            ALICE,
            CreateBookmark {
                url: "https://example.com/odd".to_string(),
                description: Some("llm-fail".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

    let failed = wait_enriched(&t.app, ALICE, &bmark.id);
    assert_eq!(failed.enrichment_status, EnrichmentStatus::Failed);
    assert!(failed.ai_summary.is_none());
}

#[test]
fn test_patch_updates_user_fields() {
    let t = create_app(false);
    let (bmark, _) = t
        .app
        .create_bookmark(ALICE, create("https://example.com/a"))
        .unwrap();

    let patched = t
        .app
        .update_bookmark(
            ALICE,
            &bmark.id,
            BookmarkPatch {
                clean_title: Some("My title".to_string()),
                auto_tags: Some(vec!["Rust".to_string(), "rust".to_string(), " ".to_string()]),
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(patched.clean_title, "My title");
    assert_eq!(patched.auto_tags, vec!["rust".to_string()]);
    assert!(patched.updated_at >= bmark.updated_at);
}

#[test]
fn test_patch_rejects_someone_elses_folder() {
    let t = create_app(false);
    let (bmark, _) = t
        .app
        .create_bookmark(ALICE, create("https://example.com/a"))
        .unwrap();
    let bobs = t.app.create_folder(BOB, folder("Bob stuff")).unwrap();

    let err = t
        .app
        .update_bookmark(
            ALICE,
            &bmark.id,
            BookmarkPatch {
                folder_id: Some(Some(bobs.id)),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[test]
fn test_deleting_a_folder_unfiles_its_bookmarks() {
    let t = create_app(false);
    let reading = t.app.create_folder(ALICE, folder("Reading")).unwrap();
    let (bmark, _) = t
        .app
        .create_bookmark(ALICE, create("https://example.com/a"))
        .unwrap();
    t.app
        .update_bookmark(
            ALICE,
            &bmark.id,
            BookmarkPatch {
                folder_id: Some(Some(reading.id.clone())),
                ..Default::default()
            },
        )
        .unwrap();

    let folders = t.app.list_folders(ALICE);
    assert_eq!(folders.len(), 1);
    assert_eq!(folders[0].bookmark_count, 1);

    assert_eq!(t.app.delete_folder(ALICE, &reading.id).unwrap(), 1);
    let kept = t.app.get_bookmark(ALICE, &bmark.id).unwrap();
    assert_eq!(kept.folder_id, None);
    assert!(t.app.list_folders(ALICE).is_empty());

    let unfiled = t.app.list_bookmarks(
        ALICE,
        &ListQuery {
            folder: Some(FolderFilter::Unfiled),
            ..Default::default()
        },
    );
    assert_eq!(unfiled.total, 1);
}

#[test]
fn test_folder_names_are_unique_per_user() {
    let t = create_app(false);
    let reading = t.app.create_folder(ALICE, folder("Reading")).unwrap();
    t.app.create_folder(ALICE, folder("Later")).unwrap();

    assert!(matches!(
        t.app.create_folder(ALICE, folder("reading")),
        Err(AppError::Conflict(_))
    ));
    // bob has his own namespace
    t.app.create_folder(BOB, folder("Reading")).unwrap();

    assert!(matches!(
        t.app.update_folder(
            ALICE,
            &reading.id,
            FolderUpdate {
                name: Some("Later".to_string()),
                ..Default::default()
            }
        ),
        Err(AppError::Conflict(_))
    ));
    assert!(matches!(
        t.app.delete_folder(BOB, &reading.id),
        Err(AppError::NotFound(_))
    ));
}

#[test]
fn test_folder_delete_never_leaves_dangling_bookmarks() {
    let t = create_app(false);
    for round in 0..20 {
        let folder = t
            .app
            .create_folder(
                ALICE,
                FolderCreate {
                    name: format!("Round {round}"),
                    ..Default::default()
                },
            )
            .unwrap();
        let (bmark, _) = t
            .app
            .create_bookmark(ALICE, create(&format!("https://example.com/race/{round}")))
            .unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..5 {
                    let filed = t.app.update_bookmark(
                        ALICE,
                        &bmark.id,
                        BookmarkPatch {
                            folder_id: Some(Some(folder.id.clone())),
                            ..Default::default()
                        },
                    );
                    if let Err(err) = filed {
                        assert!(matches!(err, AppError::Validation(_)));
                    }
                }
            });
            t.app.delete_folder(ALICE, &folder.id).unwrap();
        });

        let bmark = t.app.get_bookmark(ALICE, &bmark.id).unwrap();
        assert_eq!(bmark.folder_id, None);
    }
}

#[test]
fn test_visibility_is_independent_of_other_edits() {
    let t = create_app(false);
    let (bmark, _) = t
        .app
        .create_bookmark(ALICE, create("https://example.com/share-me"))
        .unwrap();
    t.app
        .create_bookmark(ALICE, create("https://example.com/keep-private"))
        .unwrap();

    let public = t.app.set_visibility(ALICE, &bmark.id, true).unwrap();
    assert!(public.is_public);

    let edited = t
        .app
        .update_bookmark(
            ALICE,
            &bmark.id,
            BookmarkPatch {
                raw_notes: Some("worth a reread".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    assert!(edited.is_public);

    let profile = t.app.public_bookmarks("@alice", None).unwrap();
    assert_eq!(profile.total_count, 1);
    assert_eq!(profile.bookmarks[0].id, bmark.id);
    assert!(!profile.is_owner);

    t.app.set_visibility(ALICE, &bmark.id, false).unwrap();
    assert_eq!(t.app.public_bookmarks("alice", None).unwrap().total_count, 0);
}

#[test]
fn test_profile_counts_every_visible_bookmark() {
    let t = create_app(false);
    for i in 0..105 {
        let (bmark, _) = t
            .app
            .create_bookmark(ALICE, create(&format!("https://example.com/post/{i}")))
            .unwrap();
        t.app.set_visibility(ALICE, &bmark.id, true).unwrap();
    }

    let profile = t.app.public_bookmarks("@alice", None).unwrap();
    assert_eq!(profile.bookmarks.len(), 100);
    assert_eq!(profile.total_count, 105);
}

#[test]
fn test_saved_flag_is_only_for_other_viewers() {
    let t = create_app(false);
    let (shared, _) = t
        .app
        .create_bookmark(ALICE, create("https://example.com/shared"))
        .unwrap();
    t.app.set_visibility(ALICE, &shared.id, true).unwrap();
    t.app
        .create_bookmark(BOB, create("https://example.com/shared"))
        .unwrap();

    let alice = t.app.user_by_username("alice").unwrap();
    let bob = t.app.user_by_username("bob").unwrap();

    let as_bob = t.app.public_bookmarks("@alice", Some(&bob)).unwrap();
    assert!(as_bob.bookmarks[0].is_saved_by_viewer);

    let as_owner = t.app.public_bookmarks("@alice", Some(&alice)).unwrap();
    assert!(as_owner.is_owner);
    assert!(!as_owner.bookmarks[0].is_saved_by_viewer);

    let anonymous = t.app.public_bookmarks("@alice", None).unwrap();
    assert!(!anonymous.bookmarks[0].is_saved_by_viewer);
}

#[test]
fn test_track_access_counts() {
    let t = create_app(false);
    let (bmark, _) = t
        .app
        .create_bookmark(ALICE, create("https://example.com/a"))
        .unwrap();

    assert_eq!(t.app.track_access(ALICE, &bmark.id).unwrap(), 1);
    assert_eq!(t.app.track_access(ALICE, &bmark.id).unwrap(), 2);
    let read = t.app.get_bookmark(ALICE, &bmark.id).unwrap();
    assert_eq!(read.access_count, 2);
    assert!(read.last_accessed_at.is_some());
    assert!(t.app.track_access(BOB, &bmark.id).is_err());
}

#[test]
fn test_delete_bookmark_removes_it() {
    let t = create_app(false);
    let (bmark, _) = t
        .app
        .create_bookmark(ALICE, create("https://example.com/a"))
        .unwrap();

    t.app.delete_bookmark(ALICE, &bmark.id).unwrap();
    assert!(t.app.get_bookmark(ALICE, &bmark.id).is_err());
    assert!(matches!(
        t.app.delete_bookmark(ALICE, &Eid::from("missing")),
        Err(AppError::NotFound(_))
    ));
}

#[test]
fn test_collections_hold_bookmarks_until_they_are_deleted() {
    let t = create_app(false);
    let (a, _) = t
        .app
        .create_bookmark(ALICE, create("https://example.com/a"))
        .unwrap();
    let (b, _) = t
        .app
        .create_bookmark(ALICE, create("https://example.com/b"))
        .unwrap();
    let reading = t.app.create_collection(ALICE, collection("reading")).unwrap();
    let later = t.app.create_collection(ALICE, collection("later")).unwrap();

    t.app.add_to_collection(ALICE, &reading.id, &a.id).unwrap();
    t.app.add_to_collection(ALICE, &reading.id, &b.id).unwrap();
    t.app.add_to_collection(ALICE, &later.id, &a.id).unwrap();

    let detail = t.app.get_collection(ALICE, &reading.id).unwrap();
    assert_eq!(detail.bookmark_count, 2);
    let ids: Vec<_> = detail.bookmarks.iter().map(|b| b.id.clone()).collect();
    assert_eq!(ids, vec![b.id.clone(), a.id.clone()]);

    t.app.delete_bookmark(ALICE, &a.id).unwrap();

    let detail = t.app.get_collection(ALICE, &reading.id).unwrap();
    assert_eq!(detail.bookmark_count, 1);
    assert_eq!(detail.bookmarks[0].id, b.id);
    assert!(t.app.collections.bookmark_ids(&later.id).is_empty());

    // the collection goes, the bookmark stays
    t.app.delete_collection(ALICE, &reading.id).unwrap();
    assert!(t.app.get_bookmark(ALICE, &b.id).is_ok());
    assert!(matches!(
        t.app.get_collection(ALICE, &reading.id),
        Err(AppError::NotFound("Collection"))
    ));
}

#[test]
fn test_collections_are_scoped_to_their_owner() {
    let t = create_app(false);
    let (alices, _) = t
        .app
        .create_bookmark(ALICE, create("https://example.com/a"))
        .unwrap();
    let mine = t.app.create_collection(ALICE, collection("mine")).unwrap();
    let theirs = t.app.create_collection(BOB, collection("theirs")).unwrap();

    assert!(matches!(
        t.app.get_collection(BOB, &mine.id),
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        t.app.add_to_collection(BOB, &theirs.id, &alices.id),
        Err(AppError::NotFound("Bookmark"))
    ));
    assert!(matches!(
        t.app.add_to_collection(BOB, &mine.id, &alices.id),
        Err(AppError::NotFound("Collection"))
    ));
    assert_eq!(t.app.list_collections(BOB).len(), 1);

    let err = t
        .app
        .update_collection(ALICE, &mine.id, CollectionUpdate::default())
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[test]
fn test_collection_add_never_outlives_bookmark_delete() {
    let t = create_app(false);
    let reading = t.app.create_collection(ALICE, collection("reading")).unwrap();

    for round in 0..20 {
        let (bmark, _) = t
            .app
            .create_bookmark(ALICE, create(&format!("https://example.com/{round}")))
            .unwrap();

        std::thread::scope(|s| {
            let app = &t.app;
            let (id, bmark_id) = (reading.id.clone(), bmark.id.clone());
            s.spawn(move || match app.add_to_collection(ALICE, &id, &bmark_id) {
                Ok(()) | Err(AppError::NotFound("Bookmark")) => {}
                Err(err) => panic!("unexpected error: {err}"),
            });
            app.delete_bookmark(ALICE, &bmark.id).unwrap();
        });
    }

    assert!(t.app.collections.bookmark_ids(&reading.id).is_empty());
}

#[test]
fn test_keyword_search_only_sees_enriched_bookmarks() {
    let t = create_running_app(false);
    let (done, _) = t
        .app
        .create_bookmark(ALICE, create("https://example.com/tokio-runtime"))
        .unwrap();
    wait_enriched(&t.app, ALICE, &done.id);

    // matches the query but never completes
    let (broken, _) = t
        .app
        .create_bookmark(ALICE, create("https://broken.example.com/tokio"))
        .unwrap();
    wait_enriched(&t.app, ALICE, &broken.id);

    let query = SearchQuery::from_pairs(&pairs(&[("q", "tokio")])).unwrap();
    let response = t.app.search(ALICE, query).unwrap();
    assert_eq!(response.mode, SearchMode::Keyword);
    assert_eq!(response.count, 1);
    assert_eq!(response.results[0].bookmark.id, done.id);
    assert!(response.results[0].similarity.is_none());

    let history = t.app.search_history(ALICE, 10);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].query, "tokio");
    assert!(t.app.search_history(BOB, 10).is_empty());
}

#[test]
fn test_semantic_search_requires_embeddings() {
    let t = create_app(false);
    let query =
        SearchQuery::from_pairs(&pairs(&[("q", "anything"), ("mode", "semantic")])).unwrap();

    assert!(matches!(
        t.app.search(ALICE, query),
        Err(AppError::SemanticDisabled)
    ));
}

#[test]
fn test_semantic_search_ranks_by_meaning() {
    let t = create_running_app(true);
    let (rust, _) = t
        .app
        .create_bookmark(ALICE, create("https://example.com/rust-borrowing"))
        .unwrap();
    let (cooking, _) = t
        .app
        .create_bookmark(ALICE, create("https://example.com/cooking-pasta"))
        .unwrap();
    let (bobs, _) = t
        .app
        .create_bookmark(BOB, create("https://example.com/rust-traits"))
        .unwrap();
    wait_enriched(&t.app, ALICE, &rust.id);
    wait_enriched(&t.app, ALICE, &cooking.id);
    wait_enriched(&t.app, BOB, &bobs.id);

    let query =
        SearchQuery::from_pairs(&pairs(&[("q", "rust"), ("mode", "semantic")])).unwrap();
    let response = t.app.search(ALICE, query).unwrap();

    assert_eq!(response.count, 1);
    assert_eq!(response.results[0].bookmark.id, rust.id);
    assert!(response.results[0].similarity.unwrap_or_default() > 0.9);

    // deleting drops the vector as well
    t.app.delete_bookmark(ALICE, &rust.id).unwrap();
    let query =
        SearchQuery::from_pairs(&pairs(&[("q", "rust"), ("mode", "semantic")])).unwrap();
    assert_eq!(t.app.search(ALICE, query).unwrap().count, 0);
}

#[test]
fn test_semantic_search_skips_bookmarks_being_reenriched() {
    let t = create_app(true);
    let (rust, _) = t
        .app
        .create_bookmark(ALICE, create("https://example.com/rust-borrowing"))
        .unwrap();

    let (task_tx, _task_rx) = std::sync::mpsc::channel();
    let enrich = Task::Enrich {
        bookmark_id: rust.id.clone(),
        use_nano_model: false,
        job_id: None,
    };
    assert_eq!(enrich.run(&t.app.workers(), &task_tx), Status::Done);

    let semantic = || {
        let query =
            SearchQuery::from_pairs(&pairs(&[("q", "rust"), ("mode", "semantic")])).unwrap();
        t.app.search(ALICE, query).unwrap().count
    };
    assert_eq!(semantic(), 1);

    // queue is not running, the retry stays pending
    t.app.retry_enrichment(ALICE, &rust.id).unwrap();
    assert_eq!(semantic(), 0);

    assert_eq!(enrich.run(&t.app.workers(), &task_tx), Status::Done);
    assert_eq!(semantic(), 1);
}

#[test]
fn test_tag_stats_count_per_user() {
    let t = create_app(false);
    for (url, tags) in [
        ("https://example.com/1", vec!["rust", "async"]),
        ("https://example.com/2", vec!["rust"]),
    ] {
        let (bmark, _) = t.app.create_bookmark(ALICE, create(url)).unwrap();
        t.app
            .update_bookmark(
                ALICE,
                &bmark.id,
                BookmarkPatch {
                    auto_tags: Some(tags.into_iter().map(String::from).collect()),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    let stats = t.app.tag_stats(ALICE, None, 10);
    assert_eq!(stats[0].tag, "rust");
    assert_eq!(stats[0].count, 2);
    assert_eq!(stats.len(), 2);
    assert!(t.app.tag_stats(BOB, None, 10).is_empty());
}

#[test]
fn test_subscriptions() {
    let t = create_app(false);

    t.app.subscribe("@alice", "Reader@Example.com ").unwrap();
    assert!(matches!(
        t.app.subscribe("alice", "reader@example.com"),
        Err(AppError::Conflict(_))
    ));
    assert!(matches!(
        t.app.subscribe("alice", "not-an-email"),
        Err(AppError::Validation(_))
    ));
    assert!(matches!(
        t.app.subscribe("nobody", "reader@example.com"),
        Err(AppError::NotFound(_))
    ));
    assert_eq!(t.app.subscriber_count("alice").unwrap(), 1);

    let bob = t.app.user_by_username("bob").unwrap();
    let alice = t.app.user_by_username("alice").unwrap();
    assert!(matches!(
        t.app.subscribers("alice", &bob),
        Err(AppError::Unauthorized)
    ));
    assert_eq!(t.app.subscribers("alice", &alice).unwrap().len(), 1);

    t.app.unsubscribe("alice", "reader@example.com").unwrap();
    assert_eq!(t.app.subscriber_count("alice").unwrap(), 0);

    // coming back reactivates the same row
    t.app.subscribe("alice", "reader@example.com").unwrap();
    assert_eq!(t.app.subscribers("alice", &alice).unwrap().len(), 1);

    t.app.subscribe("alice", "bob@example.com").unwrap();
    assert!(t.app.is_subscribed("alice", &bob).unwrap());

    t.app
        .remove_subscriber("alice", &alice, "bob@example.com")
        .unwrap();
    assert!(!t.app.is_subscribed("alice", &bob).unwrap());
}
