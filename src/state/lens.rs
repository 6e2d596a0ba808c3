use std::{fmt, sync::Arc};

type Getter<W, P> = Arc<dyn Fn(&W) -> P + Send + Sync>;
type Setter<W, P> = Arc<dyn Fn(P, &W) -> W + Send + Sync>;

/// Get/set accessor for a part of a larger immutable value.
///
/// A well-behaved lens satisfies `get(&set(p, w)) == p` and `set(get(w), w) == w`.
pub struct Lens<W, P> {
    get: Getter<W, P>,
    set: Setter<W, P>,
}

impl<W, P> Clone for Lens<W, P> {
    fn clone(&self) -> Self {
        Self {
            get: self.get.clone(),
            set: self.set.clone(),
        }
    }
}

impl<W, P> fmt::Debug for Lens<W, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lens").finish_non_exhaustive()
    }
}

impl<W, P> Lens<W, P> {
    pub fn new(
        get: impl Fn(&W) -> P + Send + Sync + 'static,
        set: impl Fn(P, &W) -> W + Send + Sync + 'static,
    ) -> Self {
        Self {
            get: Arc::new(get),
            set: Arc::new(set),
        }
    }

    pub fn get(&self, whole: &W) -> P {
        (self.get)(whole)
    }

    /// Returns a new whole with the part replaced; `whole` is left untouched.
    pub fn set(&self, part: P, whole: &W) -> W {
        (self.set)(part, whole)
    }

    /// Focuses further into the part.
    pub fn compose<Q>(self, inner: Lens<P, Q>) -> Lens<W, Q>
    where
        W: 'static,
        P: 'static,
        Q: 'static,
    {
        let outer_get = self.get.clone();
        let inner_get = inner.get.clone();
        let outer = self;

        Lens::new(
            move |whole| (inner_get)(&(outer_get)(whole)),
            move |part, whole| {
                let current = outer.get(whole);
                outer.set(inner.set(part, &current), whole)
            },
        )
    }
}

impl<W, P> Lens<W, P>
where
    W: Clone + PartialEq,
    P: Clone + PartialEq,
{
    /// Checks both lens laws for the given whole and part.
    pub fn satisfies_laws(&self, whole: &W, part: &P) -> bool {
        let put_get = self.get(&self.set(part.clone(), whole)) == *part;
        let get_put = self.set(self.get(whole), whole) == *whole;
        put_get && get_put
    }
}

/// Lens over the element at `index` of a vector.
pub fn index<T>(index: usize) -> Lens<Vec<T>, T>
where
    T: Clone + Default + 'static,
{
    Lens::new(
        move |whole: &Vec<T>| whole.get(index).cloned().unwrap_or_default(),
        move |part, whole: &Vec<T>| {
            let mut next = whole.clone();
            if next.len() <= index {
                next.resize(index + 1, T::default());
            }
            next[index] = part;
            next
        },
    )
}
