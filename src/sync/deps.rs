//! Orders hierarchical entities so parents always come before their children.
//! Used on tags in both directions: the download applies them in this order,
//! the upload sends them in this order.

use std::collections::HashMap;

use crate::error::{NError, NResult};
use crate::models::Tag;

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Fresh,
    Visiting,
    Done,
}

/// Depth-first topological sort. Each item can be known by several keys (ie
/// a guid and a local id) and can name its parent by any of them. A parent
/// that isn't in `items` doesn't count: the item is treated as a root.
///
/// Fails with `TagCycle` naming the first item found to be its own ancestor.
pub fn toposort<T, K, P>(items: Vec<T>, keys: K, parents: P) -> NResult<Vec<T>>
    where K: Fn(&T) -> Vec<String>,
          P: Fn(&T) -> Vec<String>
{
    let mut index: HashMap<String, usize> = HashMap::with_capacity(items.len() * 2);
    for (idx, item) in items.iter().enumerate() {
        for key in keys(item) {
            index.insert(key, idx);
        }
    }
    let parent_of: Vec<Option<usize>> = items.iter()
        .map(|item| parents(item).iter().filter_map(|key| index.get(key).cloned()).next())
        .collect();

    let mut marks = vec![Mark::Fresh; items.len()];
    let mut order: Vec<usize> = Vec::with_capacity(items.len());
    for start in 0..items.len() {
        if marks[start] != Mark::Fresh { continue; }
        // walk up to the first ancestor we've already placed (or the root),
        // then place everything on the way back down
        let mut path: Vec<usize> = Vec::new();
        let mut cur = Some(start);
        while let Some(idx) = cur {
            match marks[idx] {
                Mark::Done => break,
                Mark::Visiting => {
                    let key = keys(&items[idx]).into_iter().next().unwrap_or_default();
                    return Err(NError::TagCycle(key));
                }
                Mark::Fresh => {
                    marks[idx] = Mark::Visiting;
                    path.push(idx);
                    cur = parent_of[idx];
                }
            }
        }
        for idx in path.into_iter().rev() {
            marks[idx] = Mark::Done;
            order.push(idx);
        }
    }

    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|idx| slots[idx].take()).collect())
}

/// Sort tags parent-first. Tags are known by guid and local id.
pub fn sort_tags(tags: Vec<Tag>) -> NResult<Vec<Tag>> {
    toposort(tags, |tag| {
        let mut keys = Vec::with_capacity(2);
        if let Some(ref guid) = tag.guid { keys.push(guid.clone()); }
        if !tag.local_id.is_empty() { keys.push(tag.local_id.clone()); }
        keys
    }, |tag| {
        let mut parents = Vec::with_capacity(2);
        if let Some(ref guid) = tag.parent_guid { parents.push(guid.clone()); }
        if let Some(ref local_id) = tag.parent_local_id { parents.push(local_id.clone()); }
        parents
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(guid: &str, parent: Option<&str>) -> Tag {
        Tag {
            guid: Some(String::from(guid)),
            name: Some(String::from(guid)),
            parent_guid: parent.map(String::from),
            ..Default::default()
        }
    }

    fn guids(tags: &Vec<Tag>) -> Vec<&str> {
        tags.iter().map(|x| x.guid.as_ref().unwrap().as_str()).collect()
    }

    #[test]
    fn parents_come_first() {
        let tags = vec![
            tag("grandchild", Some("child")),
            tag("child", Some("root")),
            tag("other", None),
            tag("root", None),
            tag("child2", Some("root")),
        ];
        let sorted = sort_tags(tags).unwrap();
        assert_eq!(guids(&sorted), vec!["root", "child", "grandchild", "other", "child2"]);
    }

    #[test]
    fn missing_parent_is_a_root() {
        let tags = vec![tag("b", Some("a")), tag("c", Some("not-in-batch"))];
        let sorted = sort_tags(tags).unwrap();
        assert_eq!(guids(&sorted), vec!["b", "c"]);
    }

    #[test]
    fn parent_by_local_id() {
        let mut parent = Tag::new("parent");
        parent.local_id = String::from("local-parent");
        parent.guid = Some(String::from("g-parent"));
        let mut child = Tag::new("child");
        child.local_id = String::from("local-child");
        child.parent_local_id = Some(String::from("local-parent"));
        let sorted = sort_tags(vec![child, parent]).unwrap();
        assert_eq!(sorted[0].local_id, "local-parent");
        assert_eq!(sorted[1].local_id, "local-child");
    }

    #[test]
    fn detects_cycles() {
        let tags = vec![tag("x", None), tag("a", Some("b")), tag("b", Some("a"))];
        match sort_tags(tags) {
            Err(NError::TagCycle(ref key)) => assert_eq!(key, "a"),
            x => panic!("expected a cycle, got {:?}", x),
        }
        match sort_tags(vec![tag("self", Some("self"))]) {
            Err(NError::TagCycle(ref key)) => assert_eq!(key, "self"),
            x => panic!("expected a cycle, got {:?}", x),
        }
    }
}
