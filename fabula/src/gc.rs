use log::debug;

use crate::heap::{Heap, NO_OBJECT};
use crate::value::{Value, ValueTag};

/// Stop-the-world mark-and-sweep over the heap graph.
///
/// Roots are every static entry plus whatever the caller passes in: all
/// call stack frames' operand stacks and locals (a suspended continuation
/// included), the pending option list, and the parked extra slot. The mark
/// phase is an iterative worklist, so arbitrarily deep or cyclic game data
/// cannot overflow the native stack. Returns the number of entries swept.
pub fn collect(heap: &mut Heap, roots: &[Value]) -> usize {
    let mut worklist: Vec<Value> = Vec::new();

    for entry in heap.strings.values() {
        if entry.is_static {
            worklist.push(Value::string(entry.ident));
        }
    }
    for entry in heap.lists.values() {
        if entry.is_static {
            worklist.push(Value::list(entry.ident));
        }
    }
    for entry in heap.maps.values() {
        if entry.is_static {
            worklist.push(Value::map(entry.ident));
        }
    }
    for entry in heap.objects.values() {
        if entry.is_static {
            worklist.push(Value::object(entry.ident));
        }
    }
    worklist.extend_from_slice(roots);

    while let Some(value) = worklist.pop() {
        mark(heap, value, &mut worklist);
    }

    let before = heap.strings.len()
        + heap.lists.len()
        + heap.maps.len()
        + heap.objects.len();

    heap.strings.retain(|_, e| e.is_static || e.marked);
    heap.lists.retain(|_, e| e.is_static || e.marked);
    heap.maps.retain(|_, e| e.is_static || e.marked);
    heap.objects.retain(|_, e| e.is_static || e.marked);

    let after = heap.strings.len()
        + heap.lists.len()
        + heap.maps.len()
        + heap.objects.len();

    for e in heap.strings.values_mut() {
        e.marked = false;
    }
    for e in heap.lists.values_mut() {
        e.marked = false;
    }
    for e in heap.maps.values_mut() {
        e.marked = false;
    }
    for e in heap.objects.values_mut() {
        e.marked = false;
    }

    let collected = before - after;
    debug!("gc: collected {} of {} entries", collected, before);
    collected
}

/// Mark one value's entry and queue its outgoing edges. The marked flag
/// doubles as the visited set, so cycles terminate.
fn mark(heap: &mut Heap, value: Value, worklist: &mut Vec<Value>) {
    match value.tag {
        ValueTag::String => {
            // Strings have no outgoing edges.
            if let Some(entry) = heap.strings.get_mut(&value.payload) {
                entry.marked = true;
            }
        }
        ValueTag::List => {
            if let Some(entry) = heap.lists.get_mut(&value.payload) {
                if entry.marked {
                    return;
                }
                entry.marked = true;
                worklist.extend_from_slice(&entry.items);
            }
        }
        ValueTag::Map => {
            if let Some(entry) = heap.maps.get_mut(&value.payload) {
                if entry.marked {
                    return;
                }
                entry.marked = true;
                for (key, val) in entry.entries.iter() {
                    worklist.push(key.value());
                    worklist.push(*val);
                }
            }
        }
        ValueTag::Object => {
            if let Some(entry) = heap.objects.get_mut(&value.payload) {
                if entry.marked {
                    return;
                }
                entry.marked = true;
                worklist.extend(entry.properties.values().copied());
                // Forest links count as edges: an attached subtree is
                // reachable through its parent.
                for link in [entry.parent, entry.child, entry.sibling] {
                    if link != NO_OBJECT {
                        worklist.push(Value::object(link));
                    }
                }
            }
        }
        // Non-container tags terminate traversal.
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dynamic(heap: &mut Heap, tag: ValueTag) -> Value {
        heap.create(tag).unwrap()
    }

    #[test]
    fn unreachable_dynamic_entries_are_swept() {
        let mut heap = Heap::new();
        dynamic(&mut heap, ValueTag::String);
        dynamic(&mut heap, ValueTag::List);
        dynamic(&mut heap, ValueTag::Map);
        dynamic(&mut heap, ValueTag::Object);
        assert_eq!(collect(&mut heap, &[]), 4);
        assert!(heap.strings.is_empty());
        assert!(heap.objects.is_empty());
    }

    #[test]
    fn static_entries_survive_without_roots() {
        let mut heap = Heap::new();
        let s = dynamic(&mut heap, ValueTag::String);
        heap.get_string_mut(s.payload).unwrap().is_static = true;
        assert_eq!(collect(&mut heap, &[]), 0);
        assert!(heap.get_string(s.payload).is_ok());
    }

    #[test]
    fn rooted_graph_survives_including_cycles() {
        let mut heap = Heap::new();
        let list = dynamic(&mut heap, ValueTag::List);
        let map = dynamic(&mut heap, ValueTag::Map);
        let s = dynamic(&mut heap, ValueTag::String);
        // list contains itself and the map; the map points back at the list.
        {
            let entry = heap.get_list_mut(list.payload).unwrap();
            entry.items.push(list);
            entry.items.push(map);
        }
        heap.get_map_mut(map.payload)
            .unwrap()
            .entries
            .insert(s.key(), list);

        assert_eq!(collect(&mut heap, &[list]), 0);
        assert!(heap.get_list(list.payload).is_ok());
        assert!(heap.get_map(map.payload).is_ok());
        assert!(heap.get_string(s.payload).is_ok());
    }

    #[test]
    fn collection_is_idempotent() {
        let mut heap = Heap::new();
        let kept = dynamic(&mut heap, ValueTag::List);
        dynamic(&mut heap, ValueTag::List);
        assert_eq!(collect(&mut heap, &[kept]), 1);
        assert_eq!(collect(&mut heap, &[kept]), 0);
    }

    #[test]
    fn subtree_attached_to_a_static_object_survives() {
        let mut heap = Heap::new();
        let root = dynamic(&mut heap, ValueTag::Object);
        heap.get_object_mut(root.payload).unwrap().is_static = true;
        let child = dynamic(&mut heap, ValueTag::Object);
        let grandchild = dynamic(&mut heap, ValueTag::Object);
        heap.move_object(child.payload, root.payload).unwrap();
        heap.move_object(grandchild.payload, child.payload).unwrap();

        assert_eq!(collect(&mut heap, &[]), 0);
        assert_eq!(heap.children(root.payload).unwrap(), vec![child.payload]);
        assert_eq!(
            heap.children(child.payload).unwrap(),
            vec![grandchild.payload]
        );
    }

    #[test]
    fn map_keys_are_traced_as_edges() {
        let mut heap = Heap::new();
        let map = dynamic(&mut heap, ValueTag::Map);
        let key = dynamic(&mut heap, ValueTag::String);
        heap.get_map_mut(map.payload)
            .unwrap()
            .entries
            .insert(key.key(), Value::integer(1));

        assert_eq!(collect(&mut heap, &[map]), 0);
        assert!(heap.get_string(key.payload).is_ok());
    }
}
