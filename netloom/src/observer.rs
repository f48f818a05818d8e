use std::{cell::RefCell, collections::HashMap, rc::Rc};
use crate::error::Result;

// Events are plain enums per component; the name is the stable, documented
// identifier a handler binds against.
pub trait Signal {
    fn name(&self) -> &'static str;
}

pub type HandlerId = u64;

type Handler<E> = Rc<dyn Fn(&E) -> Result<()>>;

struct Slots<E> {
    events: HashMap<&'static str, Vec<(HandlerId, Handler<E>)>>,
    next_id: HandlerId,
}

// A small publish/subscribe surface, one ordered handler list per event
// name. Owned by parsers, connections and tasks; cheap to clone because the
// whole runtime is single-threaded.
pub struct Observable<E> {
    inner: Rc<RefCell<Slots<E>>>,
}

impl<E> Clone for Observable<E> {
    fn clone(&self) -> Self {
        Observable { inner: Rc::clone(&self.inner) }
    }
}

impl<E: Signal> Default for Observable<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Signal> Observable<E> {

    pub fn new() -> Self {
        Observable {
            inner: Rc::new(RefCell::new(Slots {
                events: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    // Appends the handler to the list for `name`; handlers fire in bind order.
    pub fn bind(&self, name: &'static str, handler: impl Fn(&E) -> Result<()> + 'static) -> HandlerId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        let handler: Handler<E> = Rc::new(handler);
        inner.events.entry(name).or_default().push((id, handler));
        id
    }

    // Removes the first handler with the given id, or every handler for the
    // name when no id is given. Unknown names are a no-op.
    pub fn unbind(&self, name: &'static str, id: Option<HandlerId>) {
        let mut inner = self.inner.borrow_mut();
        match (inner.events.get_mut(name), id) {
            (Some(handlers), Some(id)) => {
                if let Some(at) = handlers.iter().position(|(i, _)| *i == id) {
                    handlers.remove(at);
                }
            }
            (Some(handlers), None) => handlers.clear(),
            (None, _) => {}
        }
    }

    // Calls every handler bound to the event's name, in bind order, over the
    // list as it stood on entry. A handler unbound mid-trigger is skipped; a
    // handler error stops the dispatch and propagates to the triggerer.
    pub fn trigger(&self, event: &E) -> Result<()> {
        let snapshot: Vec<(HandlerId, Handler<E>)> = {
            let inner = self.inner.borrow();
            match inner.events.get(event.name()) {
                Some(handlers) if !handlers.is_empty() => handlers.clone(),
                _ => return Ok(()),
            }
        };
        for (id, handler) in snapshot {
            let bound = self
                .inner
                .borrow()
                .events
                .get(event.name())
                .map_or(false, |handlers| handlers.iter().any(|(i, _)| *i == id));
            if !bound {
                continue;
            }
            handler(event)?;
        }
        Ok(())
    }

    pub fn is_bound(&self, name: &'static str) -> bool {
        self.inner
            .borrow()
            .events
            .get(name)
            .map_or(false, |handlers| !handlers.is_empty())
    }

    // Forgets every handler list. Idempotent.
    pub fn destroy(&self) {
        self.inner.borrow_mut().events.clear();
    }
}
