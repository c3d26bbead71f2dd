// Document collection reconciler.
//
// Invariants of the returned collection:
// - at most one entry per id
// - no entry with status DELETED
// - ordered by `created_at` descending; equal timestamps keep their prior
//   relative order (new entries go in front of their ties)

use chrono::{DateTime, Utc};

use caseroom_common::protocol::frames::DocumentUpdate;
use caseroom_common::types::{Document, DocumentStatus};

/// Apply one document update to the collection.
///
/// `now` stamps `created_at` on a previously unknown document whose update
/// omitted it. Applying the same update twice yields the same collection.
pub fn reconcile(
    mut documents: Vec<Document>,
    update: DocumentUpdate,
    now: DateTime<Utc>,
) -> Vec<Document> {
    if update.is_delete() {
        documents.retain(|doc| doc.id != update.id);
        return documents;
    }

    match documents.iter_mut().find(|doc| doc.id == update.id) {
        Some(existing) => merge_into(existing, update),
        None => documents.insert(0, sanitize(update, now)),
    }

    sort_newest_first(&mut documents);
    documents
}

/// Seed the collection from a full list fetched out of band.
///
/// Each entry goes through [`reconcile`], so documents already delivered by
/// the stream are merged rather than duplicated.
pub fn hydrate(
    documents: Vec<Document>,
    fetched: impl IntoIterator<Item = Document>,
    now: DateTime<Utc>,
) -> Vec<Document> {
    fetched
        .into_iter()
        .fold(documents, |acc, doc| reconcile(acc, DocumentUpdate::from(doc), now))
}

/// Number of documents whose processing has finished successfully.
pub fn ready_count(documents: &[Document]) -> usize {
    documents.iter().filter(|doc| doc.is_ready()).count()
}

fn merge_into(existing: &mut Document, update: DocumentUpdate) {
    if let Some(file_name) = update.file_name {
        existing.file_name = file_name;
    }
    if let Some(status) = update.status {
        existing.status = status;
    }
    if let Some(created_at) = update.created_at {
        existing.created_at = created_at;
    }
}

fn sanitize(update: DocumentUpdate, now: DateTime<Utc>) -> Document {
    Document {
        id: update.id,
        file_name: update.file_name.unwrap_or_default(),
        status: update.status.unwrap_or(DocumentStatus::Pending),
        created_at: update.created_at.unwrap_or(now),
    }
}

fn sort_newest_first(documents: &mut [Document]) {
    // `sort_by` is stable.
    documents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0).unwrap()
    }

    fn doc(id: &str, status: DocumentStatus, minute: u32) -> Document {
        Document {
            id: id.into(),
            file_name: format!("{id}.pdf"),
            status,
            created_at: at(minute),
        }
    }

    fn update(id: &str, status: Option<DocumentStatus>) -> DocumentUpdate {
        DocumentUpdate { id: id.into(), file_name: None, status, created_at: None }
    }

    fn ids(documents: &[Document]) -> Vec<&str> {
        documents.iter().map(|doc| doc.id.as_str()).collect()
    }

    #[test]
    fn inserts_unknown_document() {
        let docs = reconcile(Vec::new(), doc("d1", DocumentStatus::Pending, 1).into(), at(59));
        assert_eq!(docs, vec![doc("d1", DocumentStatus::Pending, 1)]);
    }

    #[test]
    fn partial_update_keeps_prior_fields() {
        let docs = vec![doc("d1", DocumentStatus::Pending, 1)];
        let docs = reconcile(docs, update("d1", Some(DocumentStatus::Ready)), at(59));

        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].status, DocumentStatus::Ready);
        assert_eq!(docs[0].file_name, "d1.pdf");
        assert_eq!(docs[0].created_at, at(1));
    }

    #[test]
    fn incoming_fields_win_on_conflict() {
        let docs = vec![doc("d1", DocumentStatus::Pending, 1)];
        let incoming = DocumentUpdate {
            id: "d1".into(),
            file_name: Some("renamed.pdf".into()),
            status: Some(DocumentStatus::Failed),
            created_at: Some(at(2)),
        };
        let docs = reconcile(docs, incoming, at(59));
        assert_eq!(docs[0].file_name, "renamed.pdf");
        assert_eq!(docs[0].status, DocumentStatus::Failed);
        assert_eq!(docs[0].created_at, at(2));
    }

    #[test]
    fn new_document_without_fields_is_sanitized() {
        let docs = reconcile(Vec::new(), update("d9", None), at(30));
        assert_eq!(docs[0].file_name, "");
        assert_eq!(docs[0].status, DocumentStatus::Pending);
        assert_eq!(docs[0].created_at, at(30));
    }

    #[test]
    fn delete_removes_only_matching_entry() {
        let docs = vec![
            doc("d3", DocumentStatus::Ready, 3),
            doc("d2", DocumentStatus::Pending, 2),
            doc("d1", DocumentStatus::Failed, 1),
        ];
        let docs = reconcile(docs, update("d2", Some(DocumentStatus::Deleted)), at(59));
        assert_eq!(ids(&docs), vec!["d3", "d1"]);
    }

    #[test]
    fn delete_of_unknown_id_is_a_no_op() {
        let docs = vec![doc("d1", DocumentStatus::Ready, 1)];
        let after = reconcile(docs.clone(), update("zz", Some(DocumentStatus::Deleted)), at(59));
        assert_eq!(after, docs);
    }

    #[test]
    fn keeps_newest_first_order() {
        let mut docs = Vec::new();
        for (id, minute) in [("a", 5), ("b", 9), ("c", 1), ("d", 7)] {
            docs = reconcile(docs, doc(id, DocumentStatus::Pending, minute).into(), at(59));
        }
        assert_eq!(ids(&docs), vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn equal_timestamps_do_not_jitter_between_updates() {
        let mut docs = Vec::new();
        for id in ["a", "b", "c"] {
            docs = reconcile(docs, doc(id, DocumentStatus::Pending, 4).into(), at(59));
        }
        let before = ids(&docs).join(",");

        let docs = reconcile(docs, update("b", Some(DocumentStatus::Ready)), at(59));
        let docs = reconcile(docs, update("a", Some(DocumentStatus::Ready)), at(59));
        assert_eq!(ids(&docs).join(","), before);
    }

    #[test]
    fn applying_same_update_twice_is_idempotent() {
        let docs =
            vec![doc("d1", DocumentStatus::Pending, 1), doc("d0", DocumentStatus::Ready, 0)];
        let event = DocumentUpdate {
            id: "d2".into(),
            file_name: Some("new.pdf".into()),
            status: Some(DocumentStatus::Ready),
            created_at: Some(at(1)),
        };
        let once = reconcile(docs.clone(), event.clone(), at(59));
        let twice = reconcile(once.clone(), event, at(59));
        assert_eq!(once, twice);
    }

    #[test]
    fn hydration_does_not_duplicate_streamed_entries() {
        let streamed = reconcile(Vec::new(), doc("d1", DocumentStatus::Ready, 1).into(), at(59));
        let fetched =
            vec![doc("d1", DocumentStatus::Ready, 1), doc("d2", DocumentStatus::Pending, 2)];
        let docs = hydrate(streamed, fetched, at(59));
        assert_eq!(ids(&docs), vec!["d2", "d1"]);
    }

    #[test]
    fn hydration_drops_deleted_entries() {
        let fetched =
            vec![doc("d1", DocumentStatus::Deleted, 1), doc("d2", DocumentStatus::Pending, 2)];
        let docs = hydrate(Vec::new(), fetched, at(59));
        assert_eq!(ids(&docs), vec!["d2"]);
    }

    #[test]
    fn ready_count_accepts_both_synonyms() {
        let docs = vec![
            doc("a", DocumentStatus::Ready, 1),
            doc("b", DocumentStatus::Completed, 2),
            doc("c", DocumentStatus::Pending, 3),
            doc("d", DocumentStatus::Failed, 4),
        ];
        assert_eq!(ready_count(&docs), 2);
    }
}
