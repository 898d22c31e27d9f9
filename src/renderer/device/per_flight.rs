use std::ops::{Index, IndexMut};

use smallvec::SmallVec;

/// One `T` per frame in flight, addressed by flight index.
#[derive(Clone, Debug)]
pub(crate) struct PerFlight<T> {
    data: SmallVec<[T; 3]>,
}

impl<T> PerFlight<T> {
    pub(crate) fn new<F: FnMut(u32) -> T>(count: u32, creator: F) -> PerFlight<T> {
        PerFlight {
            data: (0..count).map(creator).collect(),
        }
    }

    pub(crate) fn try_new<E, F: FnMut(u32) -> Result<T, E>>(count: u32, creator: F) -> Result<PerFlight<T>, E> {
        Ok(PerFlight {
            data: (0..count).map(creator).collect::<Result<_, E>>()?,
        })
    }

    pub(crate) fn len(&self) -> u32 {
        self.data.len() as u32
    }

    pub(crate) fn get(&self, ix: u32) -> Option<&T> {
        self.data.get(ix as usize)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.data.iter()
    }

    pub(crate) fn into_iter(self) -> impl Iterator<Item = T> {
        self.data.into_iter()
    }
}

impl<T> Index<u32> for PerFlight<T> {
    type Output = T;

    fn index(&self, index: u32) -> &Self::Output {
        &self.data[index as usize]
    }
}

impl<T> IndexMut<u32> for PerFlight<T> {
    fn index_mut(&mut self, index: u32) -> &mut Self::Output {
        &mut self.data[index as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creator_sees_every_index_once() {
        let flights = PerFlight::try_new::<(), _>(3, |ix| Ok(ix * 10)).unwrap();
        assert_eq!(flights.iter().copied().collect::<Vec<_>>(), vec![0, 10, 20]);
        assert_eq!(flights[1], 10);
        assert!(flights.get(3).is_none());
    }

    #[test]
    fn creator_failure_short_circuits() {
        let mut calls = 0;
        let result = PerFlight::try_new(3, |ix| {
            calls += 1;
            if ix == 1 {
                Err("boom")
            } else {
                Ok(ix)
            }
        });
        assert_eq!(result.unwrap_err(), "boom");
        assert_eq!(calls, 2);
    }
}
