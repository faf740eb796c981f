use crate::error::NativeOpError;
use crate::protocol::{VDomRefPosition, VDomRefUpdate};
use crate::value::HandleRef;
use std::collections::HashMap;
use std::fmt;

/// A concrete element owned by the rendering layer.
pub trait NativeElement {
    fn focus(&self) -> Result<(), NativeOpError>;

    fn position(&self) -> Option<VDomRefPosition> {
        None
    }
}

pub struct HandleContainer {
    pub id: String,
    pub track_position: bool,
    mounted: bool,
    native: Option<Box<dyn NativeElement>>,
    last_position: Option<VDomRefPosition>,
}

impl fmt::Debug for HandleContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleContainer")
            .field("id", &self.id)
            .field("track_position", &self.track_position)
            .field("mounted", &self.mounted)
            .field("last_position", &self.last_position)
            .finish_non_exhaustive()
    }
}

impl HandleContainer {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            track_position: false,
            mounted: false,
            native: None,
            last_position: None,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn focus(&self) -> Result<(), NativeOpError> {
        match &self.native {
            Some(native) => native.focus(),
            None => Err(NativeOpError::NotMounted),
        }
    }

    fn tracked_position(&mut self) -> Option<VDomRefPosition> {
        if !self.track_position {
            return None;
        }
        let position = self.native.as_ref().and_then(|native| native.position());
        self.last_position = position.clone();
        position
    }
}

#[derive(Debug, Default)]
pub struct HandleTable {
    handles: HashMap<String, HandleContainer>,
}

impl HandleTable {
    /// Position tracking is sticky: once any reference asks for it, it stays on.
    pub fn get_or_create(&mut self, handle: &HandleRef) -> &mut HandleContainer {
        let container = self.entry(&handle.id);
        container.track_position |= handle.track_position;
        container
    }

    pub fn get(&self, id: &str) -> Option<&HandleContainer> {
        self.handles.get(id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Installs or clears the element behind `id`. Returns the update to report
    /// when the mounted flag actually changed.
    pub fn attach(
        &mut self,
        id: &str,
        native: Option<Box<dyn NativeElement>>,
    ) -> Option<VDomRefUpdate> {
        let container = self.entry(id);
        let was_mounted = container.mounted;
        container.mounted = native.is_some();
        container.native = native;

        if was_mounted == container.mounted {
            return None;
        }

        let position = container.tracked_position();
        Some(VDomRefUpdate {
            ref_id: container.id.clone(),
            has_current: container.mounted,
            position,
        })
    }

    /// Updates for mounted, position-tracked handles whose position moved since
    /// it was last reported.
    pub fn take_position_updates(&mut self) -> Vec<VDomRefUpdate> {
        let mut updates: Vec<VDomRefUpdate> = self
            .handles
            .values_mut()
            .filter(|container| container.track_position && container.mounted)
            .filter_map(|container| {
                let position = container.native.as_ref().and_then(|native| native.position());
                if position.is_none() || position == container.last_position {
                    return None;
                }
                container.last_position = position.clone();
                Some(VDomRefUpdate {
                    ref_id: container.id.clone(),
                    has_current: true,
                    position,
                })
            })
            .collect();
        updates.sort_by(|a, b| a.ref_id.cmp(&b.ref_id));
        updates
    }

    fn entry(&mut self, id: &str) -> &mut HandleContainer {
        self.handles
            .entry(id.to_string())
            .or_insert_with(|| HandleContainer::new(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DomRect;
    use std::cell::Cell;
    use std::rc::Rc;

    struct FakeElement {
        focused: Rc<Cell<u32>>,
        scroll_top: Rc<Cell<i64>>,
    }

    impl NativeElement for FakeElement {
        fn focus(&self) -> Result<(), NativeOpError> {
            self.focused.set(self.focused.get() + 1);
            Ok(())
        }

        fn position(&self) -> Option<VDomRefPosition> {
            Some(VDomRefPosition {
                scroll_top: self.scroll_top.get(),
                bounding_client_rect: DomRect::default(),
                ..VDomRefPosition::default()
            })
        }
    }

    fn fake() -> (Box<dyn NativeElement>, Rc<Cell<u32>>, Rc<Cell<i64>>) {
        let focused = Rc::new(Cell::new(0));
        let scroll_top = Rc::new(Cell::new(0));
        let element = FakeElement {
            focused: focused.clone(),
            scroll_top: scroll_top.clone(),
        };
        (Box::new(element), focused, scroll_top)
    }

    fn handle_ref(id: &str, track_position: bool) -> HandleRef {
        HandleRef {
            id: id.to_string(),
            track_position,
        }
    }

    #[test]
    fn attach_reports_only_mounted_flag_changes() {
        let mut table = HandleTable::default();
        table.get_or_create(&handle_ref("r1", false));

        let (element, _, _) = fake();
        let update = table.attach("r1", Some(element)).expect("mount reported");
        assert!(update.has_current);
        assert_eq!(update.position, None);

        let (element, _, _) = fake();
        assert!(table.attach("r1", Some(element)).is_none());

        let update = table.attach("r1", None).expect("unmount reported");
        assert!(!update.has_current);
        assert!(table.attach("r1", None).is_none());
    }

    #[test]
    fn focus_requires_a_mounted_element() {
        let mut table = HandleTable::default();
        table.get_or_create(&handle_ref("r1", false));
        let container = table.get("r1").expect("created");
        assert!(matches!(container.focus(), Err(NativeOpError::NotMounted)));

        let (element, focused, _) = fake();
        table.attach("r1", Some(element));
        table.get("r1").expect("created").focus().expect("focus");
        assert_eq!(focused.get(), 1);
    }

    #[test]
    fn track_position_is_sticky() {
        let mut table = HandleTable::default();
        table.get_or_create(&handle_ref("r1", true));
        let container = table.get_or_create(&handle_ref("r1", false));
        assert!(container.track_position);
    }

    #[test]
    fn tracked_positions_are_reported_when_they_move() {
        let mut table = HandleTable::default();
        table.get_or_create(&handle_ref("r1", true));
        let (element, _, scroll_top) = fake();

        let mount = table.attach("r1", Some(element)).expect("mount");
        assert!(mount.position.is_some());
        assert!(table.take_position_updates().is_empty());

        scroll_top.set(40);
        let updates = table.take_position_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].position.as_ref().map(|p| p.scroll_top), Some(40));
        assert!(table.take_position_updates().is_empty());
    }
}
