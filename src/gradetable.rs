use std::collections::HashMap;

/// Pivots per-student sparse score streams into a rectangular table.
///
/// Grade components (assignment names) are not known up front: each
/// student's gradeset may mention a different subset, discovered only while
/// rows are being added. A component gets a column index the first time any
/// row mentions it and keeps that index for the life of the table. Callers
/// run two passes: add every row, then read each row back padded to the
/// full component count.
#[derive(Debug, Default)]
pub struct GradeTable {
    components: Vec<String>,
    index: HashMap<String, usize>,
    grades: HashMap<String, HashMap<usize, f64>>,
}

impl GradeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a row for `student_id`. Scores accumulate on the builder and
    /// the row commits when the builder drops, on every exit path,
    /// replacing any earlier row for the same id.
    pub fn row(&mut self, student_id: impl Into<String>) -> RowBuilder<'_> {
        RowBuilder {
            table: self,
            student_id: student_id.into(),
            scores: HashMap::new(),
        }
    }

    /// Padded row for `student_id`: one slot per component seen so far,
    /// `None` where the student has no score. `None` is the only signal of
    /// missing data; a zero score is a real score. A never-seen student
    /// reads back as all-`None`.
    pub fn get_grade(&self, student_id: &str) -> Vec<Option<f64>> {
        let row = self.grades.get(student_id);
        (0..self.components.len())
            .map(|i| row.and_then(|r| r.get(&i).copied()))
            .collect()
    }

    /// Component names in first-seen order.
    pub fn get_graded_components(&self) -> Vec<String> {
        self.components.clone()
    }

    fn component_index(&mut self, name: &str) -> usize {
        if let Some(&i) = self.index.get(name) {
            return i;
        }
        let i = self.components.len();
        self.components.push(name.to_string());
        self.index.insert(name.to_string(), i);
        i
    }
}

pub struct RowBuilder<'a> {
    table: &'a mut GradeTable,
    student_id: String,
    scores: HashMap<usize, f64>,
}

impl RowBuilder<'_> {
    /// Records a score for a named component, allocating the next column
    /// index on first sight. Duplicate names within one row overwrite.
    pub fn add(&mut self, component: &str, score: f64) {
        let i = self.table.component_index(component);
        self.scores.insert(i, score);
    }
}

impl Drop for RowBuilder<'_> {
    fn drop(&mut self) {
        let scores = std::mem::take(&mut self.scores);
        let student_id = std::mem::take(&mut self.student_id);
        self.table.grades.insert(student_id, scores);
    }
}
