half a file