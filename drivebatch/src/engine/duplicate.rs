use super::store::{Item, ItemKind};

/// Returns the first sibling that makes copying `candidate` redundant.
///
/// Names compare case-sensitively and kinds must agree. Files additionally
/// need equal sizes and, when both sides carry one, equal checksums. A
/// checksum missing on either side leaves size as the only content signal,
/// which is best-effort rather than a cryptographic guarantee.
pub fn find_duplicate<'a>(candidate: &Item, siblings: &'a [Item]) -> Option<&'a Item> {
    siblings
        .iter()
        .find(|existing| is_equivalent(candidate, existing))
}

pub fn is_duplicate(candidate: &Item, siblings: &[Item]) -> bool {
    find_duplicate(candidate, siblings).is_some()
}

fn is_equivalent(candidate: &Item, existing: &Item) -> bool {
    if candidate.name != existing.name || candidate.kind != existing.kind {
        return false;
    }
    match candidate.kind {
        ItemKind::Folder => true,
        ItemKind::File => {
            candidate.size == existing.size
                && match (&candidate.checksum, &existing.checksum) {
                    (Some(left), Some(right)) => left.eq_ignore_ascii_case(right),
                    _ => true,
                }
        }
    }
}
