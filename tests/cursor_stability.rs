//! Cursor stability under a concurrent insert: a page already handed out
//! must not retroactively gain a new member.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use dwn_store::event::EventBus;
use dwn_store::kv::memory::MemoryKv;
use dwn_store::message_store::MessageStore;
use dwn_store::query::{Cursor, Direction, Filter, FilterValue, Page, Sort};
use dwn_store::scalar::Scalar;

const TENANT: &str = "did:example:alice";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Note {
    index: i64,
}

fn indexes(timestamp: f64) -> BTreeMap<String, Scalar> {
    [
        ("schema".to_string(), Scalar::from("note")),
        ("messageTimestamp".to_string(), Scalar::from(timestamp)),
    ]
    .into()
}

fn sort_asc() -> Sort {
    Sort { property: "messageTimestamp".to_string(), direction: Direction::Asc }
}

#[tokio::test]
async fn inserted_item_sorting_inside_a_returned_page_is_absent_from_the_next_page() {
    let store = MessageStore::new(Arc::new(MemoryKv::new()), Arc::new(EventBus::new()));
    store.open().await.expect("should open");
    let filter: Filter = [("schema".to_string(), FilterValue::Equal(Scalar::from("note")))].into();

    // --------------------------------------------------
    // Seed 1,000 items with distinct, ascending timestamps.
    // --------------------------------------------------
    for i in 0..1_000i64 {
        store.put(TENANT, &Note { index: i }, &indexes(i as f64), None).await.expect("should put");
    }

    // --------------------------------------------------
    // Fetch the first page of 100.
    // --------------------------------------------------
    let page = Page { limit: Some(100), cursor: None };
    let first: dwn_store::message_store::QueryResult<Note> =
        store.query(TENANT, &[filter.clone()], &sort_asc(), &page, None).await.expect("should query");
    assert_eq!(first.messages.len(), 100);
    assert_eq!(first.messages.last().unwrap().index, 99);
    let token = first.pagination_message_cid.expect("more results remain");

    // --------------------------------------------------
    // Insert a new item whose timestamp sorts inside the already-returned
    // page (between item 49 and 50).
    // --------------------------------------------------
    store.put(TENANT, &Note { index: -1 }, &indexes(49.5), None).await.expect("should put");

    // --------------------------------------------------
    // The next page, resumed from the first page's cursor, must not
    // contain the newly inserted item: it sorts before the cursor.
    // --------------------------------------------------
    let page2 = Page { limit: Some(100), cursor: Some(Cursor::decode(&token).expect("should decode cursor")) };
    let second: dwn_store::message_store::QueryResult<Note> =
        store.query(TENANT, &[filter], &sort_asc(), &page2, None).await.expect("should query");

    assert!(
        !second.messages.iter().any(|m| m.index == -1),
        "item inserted inside the first page leaked into the second"
    );
    assert_eq!(second.messages.first().unwrap().index, 100);
}
