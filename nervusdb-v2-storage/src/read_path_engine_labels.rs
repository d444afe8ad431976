use crate::idmap::LabelId;
use crate::label_interner::{LabelInterner, LabelSnapshot};
use std::sync::{Arc, Mutex, RwLock};

pub(crate) fn lookup_label_id(interner: &Mutex<LabelInterner>, name: &str) -> Option<LabelId> {
    interner.lock().unwrap().get_id(name)
}

pub(crate) fn lookup_label_name(interner: &Mutex<LabelInterner>, id: LabelId) -> Option<String> {
    interner.lock().unwrap().get_name(id).map(String::from)
}

pub(crate) fn published_label_snapshot(
    published: &RwLock<Arc<LabelSnapshot>>,
) -> Arc<LabelSnapshot> {
    published.read().unwrap().clone()
}
