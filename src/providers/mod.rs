pub mod transilien;
